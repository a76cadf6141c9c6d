use crate::{
    command_title,
    display::json_output,
    loading,
    notify_success,
    prelude::*,
    utils::secrets::master_key::key_source,
};

/// Show where the key is loaded from.
pub(crate) fn key_status() -> AnyResult<(), HearthCliError> {
    command_title!("Checking master key status");

    let check_handle = loading!("Checking key sources...");

    let source = match key_source() {
        Ok(source) => source,
        Err(e) => {
            check_handle.error();
            return Err(HearthCliError::Any(e.into()));
        }
    };

    check_handle.success();
    notify_success!("source: {source}");
    json_output(&serde_json::json!({ "source": source.to_string() }))?;

    Ok(())
}
