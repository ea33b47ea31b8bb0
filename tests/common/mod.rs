// tests/common/mod.rs
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use winecharm::{DataRoot, Settings};

/// Data root with a seeded win64 template and settings pointing at it
pub fn data_root(base: &Path) -> (DataRoot, Settings) {
    let root = DataRoot::at(base.join("winecharm")).unwrap();
    let template = root.template_dir("win64");
    let user = host_user();
    fs::create_dir_all(template.join("drive_c/users").join(&user)).unwrap();
    fs::write(template.join("system.reg"), "WINE REGISTRY Version 2\n").unwrap();
    fs::write(
        template.join("user.reg"),
        format!("[Environment]\n\"TEMP\"=\"C:\\\\users\\\\{user}\\\\Temp\"\n"),
    )
    .unwrap();

    let mut settings = Settings::default();
    settings.template = template.to_string_lossy().into_owned();
    (root, settings)
}

/// A file that hashes like any other; PE parsing degrades gracefully
pub fn fake_exe(dir: &Path, name: &str) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let exe = dir.join(name);
    fs::write(&exe, format!("MZ-fake-{name}")).unwrap();
    exe
}

pub fn host_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap()
}
