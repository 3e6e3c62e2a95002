use futures::{SinkExt, StreamExt};
use tether_domain::DisconnectNotice;
use tracing::debug;

use super::*;

/// Forwards pushed payloads to the socket until either side goes away, then
/// removes the connection row.
pub(super) async fn serve_viewer(
    state: AppState,
    connection: ViewerConnection,
    mut subscription: PushSubscription,
    socket: WebSocket,
) {
    let connection_id = connection.connection_id.clone();
    let execution_id = connection.execution_id.clone();
    let completion_notice = DisconnectNotice::execution_completed().to_json().ok();

    if let Err(error) = state.delivery_service.deliver_to_connection(&connection).await {
        warn!(
            execution_id = %execution_id,
            connection_id = %connection_id,
            error = %error,
            "catch-up delivery failed"
        );
    }

    let (mut outbound, mut inbound) = socket.split();
    loop {
        tokio::select! {
            payload = subscription.next() => {
                let Some(payload) = payload else {
                    break;
                };
                let text = match String::from_utf8(payload) {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(
                            connection_id = %connection_id,
                            error = %error,
                            "dropping non UTF-8 viewer payload"
                        );
                        continue;
                    }
                };

                let completed = completion_notice.as_deref() == Some(text.as_str());
                if outbound.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                if completed {
                    if let Err(error) = outbound.send(Message::Close(None)).await {
                        debug!(connection_id = %connection_id, error = %error, "close frame not sent");
                    }
                    break;
                }
            }
            incoming = inbound.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(subscription);
    match state
        .connection_registry
        .disconnect(connection_id.as_str())
        .await
    {
        Ok(_) => info!(
            execution_id = %execution_id,
            connection_id = %connection_id,
            "viewer disconnected"
        ),
        Err(error) => warn!(
            execution_id = %execution_id,
            connection_id = %connection_id,
            error = %error,
            "failed to remove viewer connection"
        ),
    }
}
