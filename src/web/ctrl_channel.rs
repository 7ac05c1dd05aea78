//! Defines the communication channel messages between the web server and the controller task.

use crate::machine::MachOp;
use crate::state::Changes;
use tokio::sync::{broadcast, oneshot};

/// Represents a request sent from a web handler to the controller task.
#[derive(Debug)]
pub enum CtrlRequest {
    /// A request for the full current machine state.
    GetState {
        /// The channel to send the response back on.
        respond_to: oneshot::Sender<Changes>,
    },
    /// Subscribe to state change batches. The reply carries the state at
    /// the moment of subscription so no change can fall in between.
    Subscribe {
        respond_to: oneshot::Sender<(Changes, broadcast::Receiver<Changes>)>,
    },
    /// A request to run a machine operation.
    Command {
        op: MachOp,
        respond_to: oneshot::Sender<Result<(), String>>,
    },
}
