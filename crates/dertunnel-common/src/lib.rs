mod error;
pub mod inspector;
mod keepalive;
mod queue;
mod tls;
pub mod util;
pub mod validate;
mod writer;

pub use error::TlsSetupError;
pub use inspector::{HttpHeader, HttpInspector, InspectorError, ProtocolData, ProtocolDataKind};
pub use keepalive::{Keepalive, KeepaliveConfig, PeerStatus};
pub use queue::{
    byte_queue, ByteReceiver, ByteSender, QueueError, QueuedBytes, DEFAULT_SOCKET_BUFFER,
};
pub use tls::{
    load_ca_trust, load_certs_from_pem, load_client_config, load_private_key_from_pem,
    load_server_config, load_server_config_from_pem, ServerTrust,
};
pub use util::{random_id, sleep_until_opt, Deferred, Throttled};
pub use writer::{spawn_frame_writer, FrameWriter, WRITE_QUEUE_DEPTH};
