//! Path utilities for the in-memory file server.

use alloc::string::String;
use alloc::vec::Vec;

use mos_ipc::Errno;

/// Normalize an absolute path: resolve `.` and `..`, drop redundant slashes.
///
/// Relative paths, NUL bytes and paths escaping the root are `BadPath`.
pub fn normalize_path(path: &str) -> Result<String, Errno> {
    if !path.starts_with('/') || path.contains('\0') {
        return Err(Errno::BadPath);
    }

    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if components.pop().is_none() {
                    return Err(Errno::BadPath);
                }
            }
            c => components.push(c),
        }
    }

    if components.is_empty() {
        return Ok(String::from("/"));
    }
    let mut result = String::new();
    for component in components {
        result.push('/');
        result.push_str(component);
    }
    Ok(result)
}

/// Parent of a normalized path.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

/// Last component of a normalized path.
pub fn filename(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("//etc///motd").unwrap(), "/etc/motd");
        assert_eq!(normalize_path("/bin/./sh").unwrap(), "/bin/sh");
        assert_eq!(normalize_path("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(normalize_path("/.."), Err(Errno::BadPath));
        assert_eq!(normalize_path("motd"), Err(Errno::BadPath));
        assert_eq!(normalize_path(""), Err(Errno::BadPath));
        assert_eq!(normalize_path("/a\0b"), Err(Errno::BadPath));
    }

    #[test]
    fn test_parent_and_filename() {
        assert_eq!(parent_path("/"), "/");
        assert_eq!(parent_path("/motd"), "/");
        assert_eq!(parent_path("/bin/sh"), "/bin");
        assert_eq!(filename("/"), "");
        assert_eq!(filename("/bin/sh"), "sh");
    }
}
