//! The UDP ingress actor (spec §4.1, §6): receives control datagrams,
//! decodes them, and dispatches to the controller under the shared lock.
//! Malformed datagrams are logged and dropped per spec §7's `Malformed`
//! classification; they never reach the controller.

use std::sync::Arc;

use pegasus_switch::SwitchDriver;
use pegasus_wire::{decode, CodecError, Message, MAX_DATAGRAM_SIZE};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controller::Controller;

/// Receive loop body: bind `socket`, decode and dispatch until `shutdown`
/// fires. Runs as its own tokio task; the caller owns the `JoinHandle`.
pub async fn run<D: SwitchDriver>(
    socket: UdpSocket,
    controller: Arc<Mutex<Controller<D>>>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("ingress actor shutting down");
                return;
            }
            recv = socket.recv_from(&mut buf) => match recv {
                Ok(ok) => ok,
                Err(err) => {
                    warn!(error = %err, "udp recv_from failed");
                    continue;
                }
            },
        };

        let message = match decode(&buf[..len]) {
            Ok(message) => message,
            Err(CodecError::TooLarge(n)) => {
                warn!(peer = %peer, bytes = n, "dropping oversized datagram");
                continue;
            }
            Err(err) => {
                warn!(peer = %peer, error = %err, "dropping malformed datagram");
                continue;
            }
        };

        let mut controller = controller.lock().await;
        let result = match message {
            Message::ResetRequest { num_nodes } => controller.reset(num_nodes),
            Message::HkReport { reports } => controller.handle_hk_report(&reports),
            Message::ResetReply { .. } => {
                // The controller never sends RESET_REQ itself in this
                // deployment, so an inbound reply has no handler.
                debug!(peer = %peer, "ignoring unsolicited RESET_REPLY");
                Ok(())
            }
        };
        drop(controller);

        if let Err(err) = result {
            warn!(peer = %peer, error = %err, "controller operation aborted");
        }
    }
}
