//! `fs` module: filesystem helpers for scripts

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Module};

use crate::error::Error;

fn to_script<T>(result: std::io::Result<T>) -> Result<T, Box<EvalAltResult>> {
    result.map_err(|e| Error::from(e).into_script())
}

fn read(path: ImmutableString) -> Result<ImmutableString, Box<EvalAltResult>> {
    to_script(fs::read_to_string(path.as_str())).map(Into::into)
}

fn read_bytes(path: ImmutableString) -> Result<rhai::Blob, Box<EvalAltResult>> {
    to_script(fs::read(path.as_str()))
}

fn write_text(path: ImmutableString, data: ImmutableString) -> Result<(), Box<EvalAltResult>> {
    to_script(fs::write(path.as_str(), data.as_bytes()))
}

fn write_blob(path: ImmutableString, data: rhai::Blob) -> Result<(), Box<EvalAltResult>> {
    to_script(fs::write(path.as_str(), data))
}

fn append(path: ImmutableString, data: ImmutableString) -> Result<(), Box<EvalAltResult>> {
    let mut file = to_script(fs::OpenOptions::new().create(true).append(true).open(path.as_str()))?;
    to_script(file.write_all(data.as_bytes()))
}

fn stat(path: ImmutableString) -> Result<Map, Box<EvalAltResult>> {
    let meta = to_script(fs::metadata(path.as_str()))?;
    let mut map = Map::new();
    map.insert("size".into(), Dynamic::from(meta.len() as i64));
    map.insert("isDir".into(), Dynamic::from(meta.is_dir()));
    if let Ok(modified) = meta.modified() {
        let stamp: DateTime<Utc> = modified.into();
        map.insert("modified".into(), Dynamic::from(stamp.to_rfc3339()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        map.insert("mode".into(), Dynamic::from((meta.permissions().mode() & 0o7777) as i64));
    }
    Ok(map)
}

fn read_dir(path: ImmutableString) -> Result<Array, Box<EvalAltResult>> {
    let entries = to_script(fs::read_dir(path.as_str()))?;
    let mut names = Array::new();
    for entry in entries {
        let entry = to_script(entry)?;
        names.push(Dynamic::from(entry.file_name().to_string_lossy().into_owned()));
    }
    Ok(names)
}

fn remove(path: ImmutableString, recursive: bool) -> Result<(), Box<EvalAltResult>> {
    let target = Path::new(path.as_str());
    if target.is_dir() {
        if recursive {
            to_script(fs::remove_dir_all(target))
        } else {
            to_script(fs::remove_dir(target))
        }
    } else {
        to_script(fs::remove_file(target))
    }
}

/// Register the `fs` module
pub fn register(engine: &mut Engine) {
    let mut module = Module::new();
    module.set_native_fn("read", read);
    module.set_native_fn("readBytes", read_bytes);
    module.set_native_fn("write", write_text);
    module.set_native_fn("write", write_blob);
    module.set_native_fn("append", append);
    module.set_native_fn("exists", |path: ImmutableString| {
        Ok(Path::new(path.as_str()).exists())
    });
    module.set_native_fn("isDir", |path: ImmutableString| {
        Ok(Path::new(path.as_str()).is_dir())
    });
    module.set_native_fn("isFile", |path: ImmutableString| {
        Ok(Path::new(path.as_str()).is_file())
    });
    module.set_native_fn("mkdir", |path: ImmutableString| to_script(fs::create_dir(path.as_str())));
    module.set_native_fn("mkdir", |path: ImmutableString, recursive: bool| {
        if recursive {
            to_script(fs::create_dir_all(path.as_str()))
        } else {
            to_script(fs::create_dir(path.as_str()))
        }
    });
    module.set_native_fn("remove", |path: ImmutableString| remove(path, false));
    module.set_native_fn("remove", remove);
    module.set_native_fn("readDir", read_dir);
    module.set_native_fn("stat", stat);
    module.set_native_fn("copy", |src: ImmutableString, dst: ImmutableString| {
        to_script(fs::copy(src.as_str(), dst.as_str()).map(|n| n as i64))
    });
    module.set_native_fn("rename", |src: ImmutableString, dst: ImmutableString| {
        to_script(fs::rename(src.as_str(), dst.as_str()))
    });
    module.set_native_fn("tempDir", || {
        Ok(ImmutableString::from(std::env::temp_dir().to_string_lossy().into_owned()))
    });
    module.set_native_fn("abs", |path: ImmutableString| -> Result<ImmutableString, Box<EvalAltResult>> {
        to_script(fs::canonicalize(path.as_str()))
            .map(|p| ImmutableString::from(p.to_string_lossy().into_owned()))
    });
    engine.register_static_module("fs", module.into());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt").to_string_lossy().into_owned();
        write_text(path.clone().into(), "one".into()).unwrap();
        append(path.clone().into(), "+two".into()).unwrap();
        assert_eq!(read(path.into()).unwrap().as_str(), "one+two");
    }

    #[test]
    fn test_stat_and_read_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.bin");
        fs::write(&file, [0u8; 10]).unwrap();
        let info = stat(file.to_string_lossy().into_owned().into()).unwrap();
        assert_eq!(info.get("size").unwrap().as_int().unwrap(), 10);
        assert!(!info.get("isDir").unwrap().as_bool().unwrap());

        let names = read_dir(dir.path().to_string_lossy().into_owned().into()).unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].to_string(), "data.bin");
    }

    #[test]
    fn test_remove_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("x"), "x").unwrap();
        let root = dir.path().join("a").to_string_lossy().into_owned();
        assert!(remove(root.clone().into(), false).is_err());
        remove(root.clone().into(), true).unwrap();
        assert!(!Path::new(&root).exists());
    }

    #[test]
    fn test_missing_file_errors() {
        let err = read("/definitely/not/here".into()).unwrap_err();
        assert!(err.to_string().contains("io error"));
    }
}
