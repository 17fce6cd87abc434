//! Bridge ABI smoke test: the string-in/string-out contract, driven the
//! way a native wrapper would drive it.  One test function because the
//! bridge holds process-wide state.

use causality_mobile::bridge;
use std::ffi::{CStr, CString, c_char};

/// Take ownership of a bridge-returned string and free it properly.
fn consume(ptr: *mut c_char) -> String {
    assert!(!ptr.is_null());
    let value = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
    unsafe { bridge::causality_string_free(ptr) };
    value
}

fn c(s: &str) -> CString {
    CString::new(s).unwrap()
}

#[test]
fn bridge_lifecycle_contract() {
    // Before init: NOT_INITIALIZED, not a crash.
    let err = consume(unsafe { bridge::causality_track(c(r#"{"type":"x"}"#).as_ptr()) });
    assert!(err.starts_with("NOT_INITIALIZED"), "got: {}", err);

    // Init with an invalid config reports the reason.
    let err = consume(unsafe { bridge::causality_init(c(r#"{"api_key":"k"}"#).as_ptr()) });
    assert!(err.contains("endpoint") || err.contains("app_id"), "got: {}", err);

    // Valid init: empty string means success.
    let config = r#"{"api_key":"k","endpoint":"http://localhost:8080","app_id":"a"}"#;
    let err = consume(unsafe { bridge::causality_init(c(config).as_ptr()) });
    assert_eq!(err, "");

    // Platform context and network info accept plain strings.
    let err = consume(unsafe {
        bridge::causality_set_platform_context(
            c("ios").as_ptr(),
            c("17.2").as_ptr(),
            c("iPhone15,2").as_ptr(),
            c("Apple").as_ptr(),
            c("3.1.0").as_ptr(),
            c("4711").as_ptr(),
            1179,
            2556,
            c("en_US").as_ptr(),
            c("America/New_York").as_ptr(),
        )
    });
    assert_eq!(err, "");
    let err = consume(unsafe {
        bridge::causality_set_network_info(c("T-Mobile").as_ptr(), c("wifi").as_ptr())
    });
    assert_eq!(err, "");

    // Identity round trip.
    let err = consume(unsafe {
        bridge::causality_set_user(
            c("user-9").as_ptr(),
            c(r#"{"plan":"pro"}"#).as_ptr(),
            c(r#"["anon-1"]"#).as_ptr(),
        )
    });
    assert_eq!(err, "");
    assert_eq!(consume(bridge::causality_get_user_id()), "user-9");

    let device_id = consume(bridge::causality_get_device_id());
    assert_eq!(device_id.len(), 32);

    // Tracking: valid succeeds, missing type reports the frozen code.
    let err = consume(unsafe {
        bridge::causality_track(c(r#"{"type":"screen_view","properties":{}}"#).as_ptr())
    });
    assert_eq!(err, "");
    let err = consume(unsafe { bridge::causality_track(c(r#"{"properties":{}}"#).as_ptr()) });
    assert!(err.starts_with("EVENT_TYPE_REQUIRED"), "got: {}", err);

    let err =
        consume(unsafe { bridge::causality_track_typed(c("commerce").as_ptr(), c("{}").as_ptr()) });
    assert_eq!(err, "");

    // Lifecycle notifications never error.
    assert_eq!(consume(bridge::causality_app_did_enter_background()), "");
    assert_eq!(consume(bridge::causality_app_will_enter_foreground()), "");

    // Reset clears identity and rotates the device id.
    let err = consume(bridge::causality_reset_all());
    assert_eq!(err, "");
    assert_eq!(consume(bridge::causality_get_user_id()), "");
    assert_ne!(consume(bridge::causality_get_device_id()), device_id);

    // Shutdown is idempotent and everything after it is NOT_INITIALIZED.
    assert_eq!(consume(bridge::causality_shutdown()), "");
    assert_eq!(consume(bridge::causality_shutdown()), "");
    let err = consume(unsafe { bridge::causality_track(c(r#"{"type":"x"}"#).as_ptr()) });
    assert!(err.starts_with("NOT_INITIALIZED"));

    // Null pointers are tolerated.
    unsafe { bridge::causality_string_free(std::ptr::null_mut()) };
}
