pub use crate::{
    CompatibilityMatrix,
    GLock, GLockGuard,
    RwLock, RwLockReadGuard, RwLockWriteGuard, Preference,
    Timeout,
    LockError, LockResult,
    SharedMutex,
};
