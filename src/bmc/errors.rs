// src/bmc/errors.rs

//! Dell iDRAC error code table and mapping: exact-code match first, then
//! a message-substring heuristic, matching the codes Dell documents for
//! Redfish/RACADM operations.

use crate::error::AdapterError;

struct DellErrorEntry {
    code: &'static str,
    message: &'static str,
    retry: bool,
    wait_seconds: u64,
}

const RAC0508: DellErrorEntry = DellErrorEntry {
    code: "RAC0508",
    message: "iDRAC is performing another configuration export. Wait and retry.",
    retry: true,
    wait_seconds: 30,
};
const RAC0509: DellErrorEntry = DellErrorEntry {
    code: "RAC0509",
    message: "iDRAC is performing another configuration import. Wait and retry.",
    retry: true,
    wait_seconds: 30,
};
const SYS403: DellErrorEntry = DellErrorEntry {
    code: "SYS403",
    message: "Server is in POST. Cannot perform configuration changes until POST completes.",
    retry: true,
    wait_seconds: 60,
};
const SYS424: DellErrorEntry = DellErrorEntry {
    code: "SYS424",
    message: "Server is rebooting. Wait for reboot to complete.",
    retry: true,
    wait_seconds: 120,
};
const FWU001: DellErrorEntry = DellErrorEntry {
    code: "FWU001",
    message: "Firmware update already in progress. Only one update can run at a time.",
    retry: true,
    wait_seconds: 300,
};
const FWU002: DellErrorEntry = DellErrorEntry {
    code: "FWU002",
    message: "Firmware image is invalid or corrupted.",
    retry: false,
    wait_seconds: 0,
};
const JOB001: DellErrorEntry = DellErrorEntry {
    code: "JOB001",
    message: "Job queue is full. Clear completed jobs or wait for current jobs to finish.",
    retry: true,
    wait_seconds: 60,
};
const AUTH001: DellErrorEntry = DellErrorEntry {
    code: "AUTH001",
    message: "Authentication failed. Check username and password.",
    retry: false,
    wait_seconds: 0,
};
const AUTH002: DellErrorEntry = DellErrorEntry {
    code: "AUTH002",
    message: "Session expired. Re-authenticate and retry.",
    retry: true,
    wait_seconds: 5,
};
const RES001: DellErrorEntry = DellErrorEntry {
    code: "RES001",
    message: "Requested resource not found. Check iDRAC firmware version and endpoint support.",
    retry: false,
    wait_seconds: 0,
};
const TIMEOUT: DellErrorEntry = DellErrorEntry {
    code: "TIMEOUT",
    message: "Operation timed out. iDRAC may be busy or unresponsive.",
    retry: true,
    wait_seconds: 30,
};

const KNOWN_CODES: &[DellErrorEntry] = &[
    RAC0508, RAC0509, SYS403, SYS424, FWU001, FWU002, JOB001, AUTH001, AUTH002, RES001, TIMEOUT,
];

fn entry_to_adapter_error(entry: &DellErrorEntry, status: Option<u16>) -> AdapterError {
    let mut err = AdapterError::new(entry.code, entry.message);
    if entry.retry {
        err = err.retryable(entry.wait_seconds);
    }
    if let Some(status) = status {
        err = err.with_status(status);
    }
    err
}

/// Maps a raw Dell error code and/or free-text message to a typed
/// `AdapterError`, following the original's two-pass strategy: exact code
/// match first, then message-content heuristics, then a conservative
/// non-retryable fallback.
pub fn map_dell_error(code: Option<&str>, message: &str, status: Option<u16>) -> AdapterError {
    if let Some(code) = code {
        if let Some(entry) = KNOWN_CODES.iter().find(|e| e.code == code) {
            return entry_to_adapter_error(entry, status);
        }
    }

    let lower = message.to_lowercase();
    let by_message = if lower.contains("export") && lower.contains("in progress") {
        Some(&RAC0508)
    } else if lower.contains("import") && lower.contains("in progress") {
        Some(&RAC0509)
    } else if lower.contains("post") || lower.contains("bios") {
        Some(&SYS403)
    } else if lower.contains("reboot") || lower.contains("restart") {
        Some(&SYS424)
    } else if lower.contains("firmware") && lower.contains("progress") {
        Some(&FWU001)
    } else if lower.contains("job queue") || lower.contains("queue full") {
        Some(&JOB001)
    } else if lower.contains("authentication") || lower.contains("unauthorized") {
        Some(&AUTH001)
    } else if lower.contains("session") && lower.contains("expired") {
        Some(&AUTH002)
    } else if lower.contains("not found") || lower.contains("404") {
        Some(&RES001)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        Some(&TIMEOUT)
    } else {
        None
    };

    match by_message {
        Some(entry) => entry_to_adapter_error(entry, status),
        None => {
            let mut err = AdapterError::new(code.unwrap_or("UNKNOWN"), message);
            if let Some(status) = status {
                err = err.with_status(status);
            }
            err
        }
    }
}

/// Extracts `(code, message)` from a Redfish `@Message.ExtendedInfo` error
/// body, following the original's two response-shape fallback.
pub fn extract_message_info(body: &serde_json::Value) -> (Option<String>, String) {
    if let Some(extended) = body
        .pointer("/error/@Message.ExtendedInfo")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
    {
        let message_id = extended.get("MessageId").and_then(|v| v.as_str());
        let code = message_id.and_then(|id| id.rsplit('.').next()).map(str::to_string);
        let message = extended
            .get("Message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if code.is_some() {
            return (code, message);
        }
    }

    if let Some(error_obj) = body.get("error") {
        let code = error_obj.get("code").and_then(|v| v.as_str()).map(str::to_string);
        let message = error_obj
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        return (code, message);
    }

    (None, String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_code_match_carries_retry_and_wait_hint() {
        let err = map_dell_error(Some("RAC0508"), "", Some(503));
        assert_eq!(err.code, "RAC0508");
        assert!(err.retryable);
        assert_eq!(err.wait_hint_seconds, Some(30));
        assert_eq!(err.status, Some(503));
    }

    #[test]
    fn message_heuristic_matches_export_in_progress() {
        let err = map_dell_error(None, "Configuration export in progress", None);
        assert_eq!(err.code, "RAC0508");
    }

    #[test]
    fn unknown_error_is_conservative_non_retryable() {
        let err = map_dell_error(Some("FOO999"), "something weird", None);
        assert_eq!(err.code, "FOO999");
        assert!(!err.retryable);
    }

    #[test]
    fn extract_message_info_prefers_extended_info_array() {
        let body = serde_json::json!({
            "error": {
                "@Message.ExtendedInfo": [
                    {"MessageId": "Base.1.0.RAC0508", "Message": "export busy"}
                ]
            }
        });
        let (code, message) = extract_message_info(&body);
        assert_eq!(code.as_deref(), Some("RAC0508"));
        assert_eq!(message, "export busy");
    }

    #[test]
    fn extract_message_info_falls_back_to_direct_error_object() {
        let body = serde_json::json!({"error": {"code": "AUTH001", "message": "bad creds"}});
        let (code, message) = extract_message_info(&body);
        assert_eq!(code.as_deref(), Some("AUTH001"));
        assert_eq!(message, "bad creds");
    }
}
