use std::sync::Arc;

use super::SpinNoSignalLock;

pub type ShareMutex<T> = Arc<SpinNoSignalLock<T>>;

pub fn new_share_mutex<T>(data: T) -> ShareMutex<T> {
    Arc::new(SpinNoSignalLock::new(data))
}
