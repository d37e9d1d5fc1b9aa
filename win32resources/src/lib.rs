//! Loads strings from the string table of the module we're linked into, with
//! a built-in fallback for when the resource isn't there (tests, mostly).
use std::borrow::Cow;
use std::ffi::c_void;
use std::ops::Deref;
use std::ptr::null_mut;
use std::slice::from_raw_parts;
use std::sync::OnceLock;

#[allow(clippy::upper_case_acronyms)]
type HINSTANCE = *const c_void;

extern "system" {
    fn LoadStringW(hInstance: HINSTANCE, uID: u32, lpBuffer: *mut u16, cchBufferMax: i32) -> i32;
}

extern "C" {
    static __ImageBase: [u8; 0];
}

fn module_base() -> *const c_void {
    unsafe { (&__ImageBase) as *const [u8; 0] as *const c_void }
}

pub struct StaticStringResource {
    id: u32,
    value: OnceLock<Cow<'static, str>>,
    fallback: &'static str,
}

impl StaticStringResource {
    pub const fn new(id: u32, fallback: &'static str) -> Self {
        Self {
            id,
            value: OnceLock::new(),
            fallback,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn get(&self) -> &str {
        self.value.get_or_init(|| {
            let image_base = module_base();

            // With a zero buffer size, LoadStringW hands back a pointer into
            // the mapped resource instead of copying. 0 means not found.
            let mut base: *const u16 = null_mut();
            let len = unsafe { LoadStringW(image_base, self.id, &mut base as *mut _ as *mut _, 0) };
            if len <= 0 {
                return Cow::Borrowed(self.fallback);
            }

            Cow::Owned(String::from_utf16_lossy(unsafe {
                from_raw_parts(base, len as usize)
            }))
        })
    }

    /// The string with each `{n}` replaced by `args[n]`. Placeholders without
    /// a matching argument are left alone.
    pub fn format(&self, args: &[&str]) -> String {
        format_placeholders(self.get(), args)
    }
}

impl Deref for StaticStringResource {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.get()
    }
}

fn format_placeholders(template: &str, args: &[&str]) -> String {
    let mut out = template.to_owned();
    for (i, arg) in args.iter().enumerate() {
        out = out.replace(&format!("{{{i}}}"), arg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Nothing in the test binary's string table.
    static MISSING: StaticStringResource = StaticStringResource::new(0xFFF0, "open {0} on {1}");

    #[test]
    fn test_missing_resource_falls_back() {
        assert_eq!(MISSING.get(), "open {0} on {1}");
        assert_eq!(&*MISSING, "open {0} on {1}");
        assert_eq!(MISSING.id(), 0xFFF0);
    }

    #[test]
    fn test_format() {
        assert_eq!(
            MISSING.format(&["Emergency", "WinSTA0"]),
            "open Emergency on WinSTA0"
        );
        assert_eq!(MISSING.format(&["Emergency"]), "open Emergency on {1}");
        assert_eq!(format_placeholders("{0}{0}", &["ab"]), "abab");
    }
}
