//! C bridge surface.
//!
//! The ABI is deliberately primitive: strings in, strings out, complex
//! data as JSON.  Operations return an error string — empty means success
//! — and getters return their value directly (empty when unavailable).
//! Every returned pointer is owned by the caller and must be released
//! with `causality_string_free`.
//!
//! A process-wide slot holds the single SDK instance; calls before
//! `causality_init` fail with `NOT_INITIALIZED`.

use crate::error::SdkError;
use crate::sdk::Sdk;
use std::ffi::{CStr, CString, c_char};
use std::sync::{Arc, RwLock};

static SDK: RwLock<Option<Arc<Sdk>>> = RwLock::new(None);

/// `(code, message, severity)` callback registered by the native wrapper.
pub type CErrorCallback = extern "C" fn(*const c_char, *const c_char, i64);

// ---------------------------------------------------------------------------
// String helpers
// ---------------------------------------------------------------------------

fn to_c_string(s: String) -> *mut c_char {
    // Interior NULs cannot cross the ABI; drop them rather than fail.
    CString::new(s.replace('\0', ""))
        .unwrap_or_default()
        .into_raw()
}

fn ok() -> *mut c_char {
    to_c_string(String::new())
}

fn error_string(e: &SdkError) -> *mut c_char {
    to_c_string(format!("{}: {}", e.code(), e))
}

/// # Safety
/// `ptr` must be null or a valid NUL-terminated C string.
unsafe fn arg(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

fn with_sdk(f: impl FnOnce(&Sdk) -> Result<(), SdkError>) -> *mut c_char {
    let guard = SDK.read().unwrap_or_else(std::sync::PoisonError::into_inner);
    match guard.as_ref() {
        Some(sdk) => match f(sdk) {
            Ok(()) => ok(),
            Err(e) => {
                sdk.notify_error_callbacks(&e);
                error_string(&e)
            }
        },
        None => error_string(&SdkError::NotInitialized),
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// # Safety
/// `config_json` must be null or a valid NUL-terminated C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn causality_init(config_json: *const c_char) -> *mut c_char {
    let config = unsafe { arg(config_json) };
    match Sdk::init(&config) {
        Ok(sdk) => {
            *SDK.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::new(sdk));
            ok()
        }
        Err(e) => error_string(&e),
    }
}

/// Stop the flush loop (final flush included) and drop the instance.
#[unsafe(no_mangle)]
pub extern "C" fn causality_shutdown() -> *mut c_char {
    let taken = SDK
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .take();
    if let Some(sdk) = taken {
        sdk.shutdown();
    }
    ok()
}

// ---------------------------------------------------------------------------
// Tracking
// ---------------------------------------------------------------------------

/// # Safety
/// `event_json` must be null or a valid NUL-terminated C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn causality_track(event_json: *const c_char) -> *mut c_char {
    let event = unsafe { arg(event_json) };
    with_sdk(|sdk| sdk.track(&event))
}

/// # Safety
/// Both arguments must be null or valid NUL-terminated C strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn causality_track_typed(
    event_type: *const c_char,
    properties_json: *const c_char,
) -> *mut c_char {
    let event_type = unsafe { arg(event_type) };
    let properties = unsafe { arg(properties_json) };
    with_sdk(|sdk| sdk.track_typed(&event_type, &properties))
}

#[unsafe(no_mangle)]
pub extern "C" fn causality_flush() -> *mut c_char {
    with_sdk(Sdk::flush)
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// # Safety
/// All arguments must be null or valid NUL-terminated C strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn causality_set_user(
    user_id: *const c_char,
    traits_json: *const c_char,
    aliases_json: *const c_char,
) -> *mut c_char {
    let user_id = unsafe { arg(user_id) };
    let traits_raw = unsafe { arg(traits_json) };
    let aliases_raw = unsafe { arg(aliases_json) };
    with_sdk(|sdk| {
        let traits = if traits_raw.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&traits_raw).map_err(|e| SdkError::InvalidJson(e.to_string()))?
        };
        let aliases: Vec<String> = if aliases_raw.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&aliases_raw).map_err(|e| SdkError::InvalidJson(e.to_string()))?
        };
        sdk.set_user(&user_id, traits, aliases)
    })
}

/// Returns the current user id (empty when no identity is set).
#[unsafe(no_mangle)]
pub extern "C" fn causality_get_user_id() -> *mut c_char {
    let guard = SDK.read().unwrap_or_else(std::sync::PoisonError::into_inner);
    match guard.as_ref() {
        Some(sdk) => to_c_string(sdk.user_id()),
        None => to_c_string(String::new()),
    }
}

/// Returns the stable device id (empty before init or on storage failure).
#[unsafe(no_mangle)]
pub extern "C" fn causality_get_device_id() -> *mut c_char {
    let guard = SDK.read().unwrap_or_else(std::sync::PoisonError::into_inner);
    match guard.as_ref() {
        Some(sdk) => to_c_string(sdk.device_id().unwrap_or_default()),
        None => to_c_string(String::new()),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn causality_reset_all() -> *mut c_char {
    with_sdk(Sdk::reset_all)
}

// ---------------------------------------------------------------------------
// Lifecycle notifications and platform context
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn causality_app_did_enter_background() -> *mut c_char {
    with_sdk(|sdk| {
        sdk.app_did_enter_background();
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn causality_app_will_enter_foreground() -> *mut c_char {
    with_sdk(|sdk| {
        sdk.app_will_enter_foreground();
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn causality_set_session_tracking_enabled(enabled: bool) -> *mut c_char {
    with_sdk(|sdk| {
        sdk.set_session_tracking_enabled(enabled);
        Ok(())
    })
}

/// # Safety
/// All pointer arguments must be null or valid NUL-terminated C strings.
#[unsafe(no_mangle)]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn causality_set_platform_context(
    platform: *const c_char,
    os_version: *const c_char,
    model: *const c_char,
    manufacturer: *const c_char,
    app_version: *const c_char,
    build_number: *const c_char,
    screen_width: i64,
    screen_height: i64,
    locale: *const c_char,
    timezone: *const c_char,
) -> *mut c_char {
    let platform = unsafe { arg(platform) };
    let os_version = unsafe { arg(os_version) };
    let model = unsafe { arg(model) };
    let manufacturer = unsafe { arg(manufacturer) };
    let app_version = unsafe { arg(app_version) };
    let build_number = unsafe { arg(build_number) };
    let locale = unsafe { arg(locale) };
    let timezone = unsafe { arg(timezone) };
    with_sdk(|sdk| {
        sdk.platform_context().set_platform_context(
            &platform,
            &os_version,
            &model,
            &manufacturer,
            &app_version,
            &build_number,
            screen_width.max(0) as u32,
            screen_height.max(0) as u32,
            &locale,
            &timezone,
        );
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn causality_set_environment_flags(
    is_jailbroken: bool,
    is_emulator: bool,
) -> *mut c_char {
    with_sdk(|sdk| {
        sdk.platform_context()
            .set_environment_flags(is_jailbroken, is_emulator);
        Ok(())
    })
}

/// # Safety
/// Both arguments must be null or valid NUL-terminated C strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn causality_set_network_info(
    carrier: *const c_char,
    network_type: *const c_char,
) -> *mut c_char {
    let carrier = unsafe { arg(carrier) };
    let network_type = unsafe { arg(network_type) };
    with_sdk(|sdk| {
        sdk.platform_context().set_network_info(&carrier, &network_type);
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Error callbacks and memory
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn causality_register_error_callback(callback: CErrorCallback) -> *mut c_char {
    with_sdk(|sdk| {
        sdk.register_error_callback(Arc::new(move |code, message, severity| {
            let code = CString::new(code.replace('\0', "")).unwrap_or_default();
            let message = CString::new(message.replace('\0', "")).unwrap_or_default();
            callback(code.as_ptr(), message.as_ptr(), severity);
        }));
        Ok(())
    })
}

/// Release a string returned by any other `causality_` function.
///
/// # Safety
/// `ptr` must be null or a pointer previously returned by this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn causality_string_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}
