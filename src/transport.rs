pub use callcore::net::{Transport, TransportEvent, TransportFactory};
pub use video_call_tokio_transport::TokioWebSocketTransportFactory;
pub use video_call_ureq_http_client::UreqHttpClient;
