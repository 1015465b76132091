//! # Request context and payload extras settings
//!
//! Capture triggers read two Postgres settings when they assemble a
//! payload: `pgbus.context` (request-level metadata, a JSON object) and
//! `pgbus.payload_extras_builder` (the name of a server-side function whose
//! result is attached under the payload's `extras` member). Both travel
//! through `set_config`, so they can be bound to the current transaction or
//! left to persist for the session.

use serde_json::{Map, Value};
use sqlx::PgExecutor;

use crate::error::{PgBusError, Result};

/// Setting the trigger reads request context from
pub const CONTEXT_SETTING: &str = "pgbus.context";

/// Setting naming the server-side extras builder function
pub const EXTRAS_BUILDER_SETTING: &str = "pgbus.payload_extras_builder";

async fn set_setting<'e, E: PgExecutor<'e>>(
    executor: E,
    name: &str,
    value: &str,
    tx_bound: bool,
) -> Result<()> {
    sqlx::query("SELECT set_config($1, $2, $3)")
        .bind(name)
        .bind(value)
        .bind(tx_bound)
        .execute(executor)
        .await?;
    Ok(())
}

/// Attach request-level context to subsequent trigger payloads.
///
/// With `tx_bound` the setting resets at transaction end, so context set
/// inside a transaction cannot leak into unrelated work on the same
/// connection.
pub async fn set_notification_context<'e, E: PgExecutor<'e>>(
    executor: E,
    context: &Map<String, Value>,
    tx_bound: bool,
) -> Result<()> {
    let encoded = Value::Object(context.clone()).to_string();
    set_setting(executor, CONTEXT_SETTING, &encoded, tx_bound).await
}

/// Reset the request context to empty
pub async fn clear_notification_context<'e, E: PgExecutor<'e>>(
    executor: E,
    tx_bound: bool,
) -> Result<()> {
    set_setting(executor, CONTEXT_SETTING, "", tx_bound).await
}

/// Configure the server-side function whose result is attached under the
/// payload's `extras` member. The trigger interpolates the name with
/// `format('%I')`, but rejecting anything outside `[A-Za-z0-9_]` here keeps
/// garbage out of the setting in the first place.
pub async fn set_payload_extras_builder<'e, E: PgExecutor<'e>>(
    executor: E,
    function: &str,
    tx_bound: bool,
) -> Result<()> {
    if !is_valid_function_name(function) {
        return Err(PgBusError::config(format!(
            "extras builder name {function:?} is not a plain SQL identifier"
        )));
    }
    set_setting(executor, EXTRAS_BUILDER_SETTING, function, tx_bound).await
}

/// Stop attaching extras to trigger payloads
pub async fn clear_payload_extras_builder<'e, E: PgExecutor<'e>>(
    executor: E,
    tx_bound: bool,
) -> Result<()> {
    set_setting(executor, EXTRAS_BUILDER_SETTING, "", tx_bound).await
}

fn is_valid_function_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_name_validation() {
        assert!(is_valid_function_name("get_extra_info"));
        assert!(is_valid_function_name("Builder2"));
        assert!(!is_valid_function_name(""));
        assert!(!is_valid_function_name("drop table; --"));
        assert!(!is_valid_function_name("schema.function"));
    }
}
