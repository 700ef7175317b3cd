//! Resource resolution and file mapping
//!
//! Turns a parsed URL into a served file: truncating concatenation against
//! the document root, permission and type checks on the stat result, then a
//! private read-only mapping of the whole file. The descriptor is closed as
//! soon as the mapping exists; the mapping outlives it.

use std::os::unix::io::RawFd;

use log::debug;

use crate::parser::HttpCode;
use crate::PATH_BUF_SIZE;

/// A private read-only mapping of one regular file
///
/// Unmapped exactly once, on drop. Connections hold this between response
/// assembly and write completion; dropping it (reset, close, or error) is
/// the release.
pub struct FileMapping {
    addr: *mut libc::c_void,
    len: usize,
}

impl FileMapping {
    /// Map `len` bytes of `fd` read-only
    ///
    /// `len` must be nonzero; mapping an empty file is an EINVAL at the
    /// kernel, so zero-length files are served without a mapping.
    fn map(fd: RawFd, len: usize) -> Option<Self> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return None;
        }
        Some(Self { addr, len })
    }

    /// Base address of the mapped region
    pub fn as_ptr(&self) -> *const u8 {
        self.addr as *const u8
    }

    /// Length of the mapped region in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the region is empty (never constructed that way)
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapped bytes as a slice
    pub fn as_slice(&self) -> &[u8] {
        // Safety: the region is PROT_READ, page-backed, and lives until drop.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.addr, self.len) };
    }
}

// Safety: the mapping is read-only and owned; moving the owner between the
// reactor and a worker moves the exclusive release responsibility with it.
unsafe impl Send for FileMapping {}

/// Outcome of a successful resolution
pub struct Resolved {
    /// Mapping of the file contents; `None` for a zero-length file
    pub mapping: Option<FileMapping>,
    /// File size according to stat
    pub size: usize,
}

/// Resolve `url` against `doc_root` and map the target file
///
/// `path_buf` receives the concatenated path (truncating at the buffer
/// bound). Returns `FileRequest` with the mapping in `out`, or the error
/// code the response should carry.
pub fn resolve(
    doc_root: &str,
    url: &[u8],
    path_buf: &mut [u8; PATH_BUF_SIZE],
    out: &mut Option<Resolved>,
) -> HttpCode {
    let path_len = concat_path(doc_root.as_bytes(), url, path_buf);

    // stat wants a terminated string; the concat left room for the NUL.
    path_buf[path_len] = 0;
    let path_ptr = path_buf.as_ptr() as *const libc::c_char;

    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::stat(path_ptr, &mut st) } < 0 {
        return HttpCode::NoResource;
    }

    if st.st_mode & libc::S_IROTH == 0 {
        return HttpCode::ForbiddenRequest;
    }

    if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
        return HttpCode::BadRequest;
    }

    let fd = unsafe { libc::open(path_ptr, libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return HttpCode::InternalError;
    }

    let size = st.st_size as usize;
    let mapping = if size == 0 {
        None
    } else {
        match FileMapping::map(fd, size) {
            Some(m) => Some(m),
            None => {
                unsafe { libc::close(fd) };
                return HttpCode::InternalError;
            }
        }
    };
    unsafe { libc::close(fd) };

    debug!(
        "resolved {} ({} bytes)",
        String::from_utf8_lossy(&path_buf[..path_len]),
        size
    );
    *out = Some(Resolved { mapping, size });
    HttpCode::FileRequest
}

/// Truncating `root || url` concatenation into `buf`
///
/// Returns the number of bytes written, at most `PATH_BUF_SIZE - 1` so a
/// terminator always fits.
fn concat_path(root: &[u8], url: &[u8], buf: &mut [u8; PATH_BUF_SIZE]) -> usize {
    let max = PATH_BUF_SIZE - 1;
    let root_len = root.len().min(max);
    buf[..root_len].copy_from_slice(&root[..root_len]);

    let url_len = url.len().min(max - root_len);
    buf[root_len..root_len + url_len].copy_from_slice(&url[..url_len]);

    root_len + url_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tinyhttpd-filemap-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();
        dir
    }

    fn world_readable(path: &PathBuf, contents: &[u8]) {
        fs::write(path, contents).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o644)).unwrap();
    }

    fn run_resolve(root: &str, url: &[u8]) -> (HttpCode, Option<Resolved>) {
        let mut path_buf = [0u8; PATH_BUF_SIZE];
        let mut out = None;
        let code = resolve(root, url, &mut path_buf, &mut out);
        (code, out)
    }

    #[test]
    fn test_missing_file_is_no_resource() {
        let dir = scratch_dir("missing");
        let (code, out) = run_resolve(dir.to_str().unwrap(), b"/missing");
        assert_eq!(code, HttpCode::NoResource);
        assert!(out.is_none());
    }

    #[test]
    fn test_directory_is_bad_request() {
        let dir = scratch_dir("dir");
        let (code, _) = run_resolve(dir.to_str().unwrap(), b"/");
        assert_eq!(code, HttpCode::BadRequest);
    }

    #[test]
    fn test_unreadable_file_is_forbidden() {
        let dir = scratch_dir("secret");
        let path = dir.join("secret");
        fs::write(&path, b"top").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        let (code, _) = run_resolve(dir.to_str().unwrap(), b"/secret");
        assert_eq!(code, HttpCode::ForbiddenRequest);
    }

    #[test]
    fn test_regular_file_maps_contents() {
        let dir = scratch_dir("file");
        world_readable(&dir.join("index.html"), b"hello world");
        let (code, out) = run_resolve(dir.to_str().unwrap(), b"/index.html");
        assert_eq!(code, HttpCode::FileRequest);
        let resolved = out.unwrap();
        assert_eq!(resolved.size, 11);
        assert_eq!(resolved.mapping.unwrap().as_slice(), b"hello world");
    }

    #[test]
    fn test_empty_file_has_no_mapping() {
        let dir = scratch_dir("empty");
        world_readable(&dir.join("empty"), b"");
        let (code, out) = run_resolve(dir.to_str().unwrap(), b"/empty");
        assert_eq!(code, HttpCode::FileRequest);
        let resolved = out.unwrap();
        assert_eq!(resolved.size, 0);
        assert!(resolved.mapping.is_none());
    }

    #[test]
    fn test_concat_truncates_at_buffer_bound() {
        let mut buf = [0u8; PATH_BUF_SIZE];
        let root = "/r";
        let url = vec![b'a'; PATH_BUF_SIZE * 2];
        let len = concat_path(root.as_bytes(), &url, &mut buf);
        assert_eq!(len, PATH_BUF_SIZE - 1);
        assert_eq!(&buf[..2], b"/r");
    }
}
