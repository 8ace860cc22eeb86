//! The process-global descriptor registry: the dispatch surface the POSIX
//! interposition shim consumes. A syscall whose descriptor is registered
//! here is served by the core; anything else falls through to the kernel.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

use crate::file::File;

lazy_static! {
    static ref FILES: RwLock<HashMap<RawFd, Arc<File>>> = RwLock::new(HashMap::new());
}

/// Registers an opened file under its descriptor, returning the fd.
pub fn register(file: &Arc<File>) -> RawFd {
    let fd = file.fd();
    let previous = FILES.write().unwrap().insert(fd, file.clone());
    debug_assert!(previous.is_none(), "descriptor {} registered twice", fd);
    log::debug!("registered fd {}", fd);
    fd
}

/// The file behind `fd`, if the core owns it.
pub fn lookup(fd: RawFd) -> Option<Arc<File>> {
    FILES.read().unwrap().get(&fd).cloned()
}

/// Drops the registration; the close interposition's path. Returns whether
/// the descriptor was ours.
pub fn forget(fd: RawFd) -> bool {
    let removed = FILES.write().unwrap().remove(&fd).is_some();
    if removed {
        log::debug!("forgot fd {}", fd);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_forget() {
        let dir = std::path::Path::new("testing_data_directories").join("registry");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let config = crate::Config {
            path: dir.join("data.lapis"),
            ..Default::default()
        };
        let file = config.open().unwrap();

        let fd = register(&file);
        assert!(lookup(fd).is_some());
        assert!(forget(fd));
        assert!(lookup(fd).is_none());
        assert!(!forget(fd));

        file.unlink_shm();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
