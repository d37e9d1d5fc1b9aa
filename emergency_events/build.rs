use std::{io, path::Path};

// The provider group GUID is not something we want checked in. The release
// pipeline hands it to us in MAGIC_TRACING_GUID, and we swap it in for the
// placeholder (ffffffff-ffff-ffff-ffff-ffffffffffff) in events_template.rs.
//
// The result goes to %OUT_DIR%/mangled_events.rs, which lib.rs includes.
fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed=src/events_template.rs");
    println!("cargo:rerun-if-env-changed=MAGIC_TRACING_GUID");

    let input = std::fs::read_to_string("src/events_template.rs")?;
    let output = match std::env::var("MAGIC_TRACING_GUID") {
        Ok(guid) => {
            println!("MAGIC_TRACING_GUID: {}", guid);
            input.replace("ffffffff-ffff-ffff-ffff-ffffffffffff", &guid)
        }
        Err(_) => input,
    };

    let out_dir = std::env::var("OUT_DIR").map_err(io::Error::other)?;
    let path = Path::new(&out_dir).join("mangled_events.rs");
    std::fs::write(path.as_path(), output)
}
