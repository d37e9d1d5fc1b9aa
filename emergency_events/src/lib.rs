//! TraceLogging provider for the emergency desktop switcher. The provider
//! definition lives in `events_template.rs`; build.rs stamps the provider
//! group GUID into it and we include the result from OUT_DIR.
include!(concat!(env!("OUT_DIR"), "/mangled_events.rs"));
