use embed_manifest::embed_manifest_file;
use {
    std::{env, io},
    winres::WindowsResource,
};

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed=emergency.rc");
    println!("cargo:rerun-if-changed=emergency.manifest");

    if env::var_os("CARGO_CFG_WINDOWS").is_some() {
        embed_manifest_file("emergency.manifest")?;

        // Not set_resource_file: we want the file version info winres
        // generates, plus our string table.
        let string_table = std::fs::read_to_string("emergency.rc")?;
        WindowsResource::new()
            .set("FileDescription", "Emergency Desktop")
            .set("ProductName", "Emergency Desktop")
            .append_rc_content(&string_table)
            .compile()?;
    }
    Ok(())
}
