#[cfg(windows)]
fn main() {
    let mut res = winres::WindowsResource::new();
    res.set("ProductName", "LumenSync");
    res.set("FileDescription", "LumenSync - Monitor Brightness Sync Service");
    res.set("LegalCopyright", "© 2025 LumenSync Contributors");
    res.set("CompanyName", "LumenSync");
    res.set("OriginalFilename", "lumensync.exe");

    if let Err(e) = res.compile() {
        eprintln!("Failed to compile Windows resource: {}", e);
    }
}

#[cfg(not(windows))]
fn main() {
}
