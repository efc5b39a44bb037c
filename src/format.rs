use serde_json::{json, Value};

use crate::falcon::ApiResponse;

/// Outcome of classifying a raw Falcon response.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// 200/201 response; carries the body verbatim.
    Success(Value),
    /// Classified error text, ready to hand back to the calling agent.
    Failure(String),
}

impl Normalized {
    pub fn into_text(self) -> String {
        match self {
            Self::Success(body) => {
                serde_json::to_string_pretty(&body).unwrap_or_else(|_| "{}".to_string())
            }
            Self::Failure(message) => message,
        }
    }
}

/// Maps an upstream response to a success body or a classified error string.
///
/// A 403 whose first error message mentions an authorization failure becomes
/// scope guidance naming `required_scopes`; any other 403 is treated like any
/// other non-2xx status. Not every 403 is a scope failure.
pub fn normalize(response: &ApiResponse, required_scopes: Option<&str>) -> Normalized {
    if response.status_code == 403 {
        let error_message = first_error_message(&response.body);
        let lowered = error_message.to_lowercase();
        if lowered.contains("access denied") || lowered.contains("authorization failed") {
            let scopes_info = required_scopes.unwrap_or("appropriate API scopes");
            return Normalized::Failure(format!(
                "API Access Denied (403): You don't have the required permissions.\n\n\
                 Required scope(s): {scopes_info}\n\n\
                 To resolve this issue:\n\
                 1. Check that your API client has been granted the {scopes_info} permission(s)\n\
                 2. Verify your CrowdStrike subscription includes access to this feature\n\
                 3. Contact your CrowdStrike administrator for assistance\n\n\
                 Original error: {error_message}"
            ));
        }
    }

    if !matches!(response.status_code, 200 | 201) {
        return Normalized::Failure(format!(
            "API Error: {} - {}",
            response.status_code,
            error_list_text(&response.body)
        ));
    }

    Normalized::Success(response.body.clone())
}

/// Message of the first entry in `body.errors`. A missing or empty list reads
/// as "Unknown error"; an entry without a message reads as the empty string.
fn first_error_message(body: &Value) -> String {
    match body
        .get("errors")
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty())
    {
        Some(list) => list[0]
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        None => "Unknown error".to_string(),
    }
}

fn error_list_text(body: &Value) -> String {
    let errors = body
        .get("errors")
        .filter(|v| !v.is_null())
        .cloned()
        .unwrap_or_else(|| json!(["Unknown error"]));
    serde_json::to_string(&errors).unwrap_or_else(|_| "[\"Unknown error\"]".to_string())
}
