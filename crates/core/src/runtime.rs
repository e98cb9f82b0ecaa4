//! ONNX Runtime shared-library discovery for the `load-dynamic` ort build.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrtDylibSource {
    /// `ORT_DYLIB_PATH` was already set by the user.
    Environment(PathBuf),
    Discovered(PathBuf),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLibStatus {
    pub ort: OrtDylibSource,
    pub preloaded: Vec<PathBuf>,
}

/// `<exe_dir>/lib`, `<exe_dir>/../lib`, `<cwd>/lib`, then system dirs on unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Preload tier for GPU runtime libraries, lowest first. ORT's own provider
/// libraries are excluded: they need symbols from the ORT dylib itself.
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name.starts_with("libcudart")
        || name.starts_with("libcublaslt")
        || name.starts_with("libcublas")
        || name.starts_with("libcufft")
        || name.starts_with("libcurand")
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name.starts_with("cudart64_") || name.starts_with("cublas64_") || name.starts_with("cublaslt64_") {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU runtime libraries found in `dirs`, in load order. The first directory
/// holding a given file name wins.
fn preload_plan(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_candidate_lib(&name, &path) || !seen_names.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Point ORT at a bundled runtime and preload CUDA/cuDNN/TensorRT with global
/// symbol visibility. Call at the start of `main()`, before any session exists.
pub fn setup_runtime_libs() -> RuntimeLibStatus {
    let dirs = candidate_lib_dirs();

    let ort = match env::var_os(ORT_DYLIB_ENV) {
        Some(path) => OrtDylibSource::Environment(PathBuf::from(path)),
        None => match find_ort_dylib_in_dirs(&dirs) {
            Some(path) => {
                env::set_var(ORT_DYLIB_ENV, &path);
                OrtDylibSource::Discovered(path)
            }
            None => OrtDylibSource::NotFound,
        },
    };

    let preloaded = preload_plan(&dirs)
        .into_iter()
        .filter(|path| unsafe { load_library(path) })
        .collect();

    RuntimeLibStatus { ort, preloaded }
}

/// Call after tracing is initialized.
pub fn log_runtime_lib_status(status: &RuntimeLibStatus) {
    match &status.ort {
        OrtDylibSource::Environment(path) if !path.is_file() => {
            warn!("{ORT_DYLIB_ENV} set to {} but file not found", path.display())
        }
        OrtDylibSource::Environment(path) | OrtDylibSource::Discovered(path) => {
            info!("ORT library: {}", path.display())
        }
        OrtDylibSource::NotFound => {
            warn!("{ORT_DYLIB_ENV} not set; ORT will try default search paths")
        }
    }
    for lib in &status.preloaded {
        debug!(lib = %lib.display(), "Preloaded GPU runtime library");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn test_candidate_lib_dirs_includes_cwd_lib() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn test_find_ort_dylib_prefers_first_dir() {
        let temp = tempfile::tempdir().unwrap();
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(second.join(ORT_LIB_NAME), b"ort").unwrap();

        assert_eq!(
            find_ort_dylib_in_dirs(&[first.clone(), second.clone()]),
            Some(second.join(ORT_LIB_NAME))
        );

        std::fs::write(first.join(ORT_LIB_NAME), b"ort").unwrap();
        assert_eq!(
            find_ort_dylib_in_dirs(&[first.clone(), second]),
            Some(first.join(ORT_LIB_NAME))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_load_priority_orders_cuda_before_cudnn_before_trt() {
        assert!(load_priority("libcudart.so.12") < load_priority("libcudnn.so.9"));
        assert!(load_priority("libcudnn.so.9") < load_priority("libnvinfer.so.10"));
        assert_eq!(load_priority("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(load_priority("libpng16.so"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_preload_plan_sorts_and_dedups() {
        let temp = tempfile::tempdir().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        for name in ["libnvinfer.so.10", "libcudart.so.12", "libonnxruntime.so"] {
            std::fs::write(a.join(name), b"").unwrap();
        }
        std::fs::write(b.join("libcudart.so.12"), b"").unwrap();
        std::fs::write(b.join("libcudnn.so.9"), b"").unwrap();

        let plan = preload_plan(&[a.clone(), b.clone()]);
        assert_eq!(
            plan,
            vec![
                a.join("libcudart.so.12"),
                b.join("libcudnn.so.9"),
                a.join("libnvinfer.so.10"),
            ]
        );
    }
}
