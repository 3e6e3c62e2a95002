use crate::store_ports::StoreItem;

use super::*;

pub(super) fn connection_to_item(connection: &ViewerConnection) -> StoreItem {
    StoreItem::new(connection_key(connection.connection_id.as_str()))
        .with_lookup_key(connection.execution_id.as_str())
        .with_attribute("execution_id", connection.execution_id.as_str())
        .with_attribute("last_index", connection.last_index)
        .with_optional_attribute("token_hash", connection.token_hash.as_deref())
        .with_optional_attribute("user_identity", connection.user_identity.as_deref())
        .with_optional_attribute("client_ip", connection.client_ip.as_deref())
        .with_expires_at(connection.expires_at)
}

pub(super) fn connection_from_item(item: &StoreItem) -> AppResult<ViewerConnection> {
    Ok(ViewerConnection {
        connection_id: item.key.partition_key.clone(),
        execution_id: item.string_attribute("execution_id")?,
        token_hash: item.optional_string_attribute("token_hash"),
        last_index: item.i64_attribute("last_index")?,
        expires_at: item.expires_at,
        user_identity: item.optional_string_attribute("user_identity"),
        client_ip: item.optional_string_attribute("client_ip"),
    })
}
