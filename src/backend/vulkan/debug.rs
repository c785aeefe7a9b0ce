//! Validation layer output routed to `log`.
//!
//! Synchronization validation (`SYNC-HAZARD-*` message ids) reports exactly
//! the class of bug this crate exists to prevent, so those messages are
//! always raised to at least `warn` regardless of the severity the layer
//! assigned.

use std::borrow::Cow;
use std::ffi::{c_void, CStr};

use ash::vk;
use log::Level;

use crate::error::{SyncError, SyncResult};

const SYNC_HAZARD_PREFIX: &str = "SYNC-HAZARD";

/// Create a messenger that forwards validation output to `log`.
pub fn create_debug_messenger(
    debug_utils: &ash::ext::debug_utils::Instance,
) -> SyncResult<vk::DebugUtilsMessengerEXT> {
    let severity = vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO;
    let types = vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(severity)
        .message_type(types)
        .pfn_user_callback(Some(on_validation_message));

    unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .map_err(|e| SyncError::Native(format!("debug messenger creation failed: {:?}", e)))
}

fn level_for(severity: vk::DebugUtilsMessageSeverityFlagsEXT, message_id: &str) -> Level {
    let level = if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        Level::Debug
    } else {
        Level::Trace
    };
    if message_id.starts_with(SYNC_HAZARD_PREFIX) {
        level.min(Level::Warn)
    } else {
        level
    }
}

fn category(message_type: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    }
}

/// # Safety
///
/// `ptr` must be null or a null-terminated string valid for `'a`.
unsafe fn c_str_or<'a>(ptr: *const std::ffi::c_char, fallback: &'static str) -> Cow<'a, str> {
    if ptr.is_null() {
        Cow::Borrowed(fallback)
    } else {
        CStr::from_ptr(ptr).to_string_lossy()
    }
}

unsafe extern "system" fn on_validation_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: the layer keeps callback_data and its strings alive for the call.
    let Some(data) = (unsafe { callback_data.as_ref() }) else {
        return vk::FALSE;
    };
    let message_id = unsafe { c_str_or(data.p_message_id_name, "") };
    let message = unsafe { c_str_or(data.p_message, "(no message)") };

    log::log!(
        target: "frame_sync::vulkan",
        level_for(severity, &message_id),
        "[{}] {} {}",
        category(message_type),
        message_id,
        message
    );

    vk::FALSE
}
