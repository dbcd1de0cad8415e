/// Domain every DNS-SD query and registration lives under
pub const LOCAL_DOMAIN: &str = "local.";

/// Label separating a subtype from its parent service type, as in
/// "_cpuTemp._sub._zmq._tcp.local."
pub const SUBTYPE_LABEL: &str = "_sub";

/// Pub/sub wire protocol version carried in the HELLO frame
pub const PUBSUB_PROTOCOL_VERSION: u8 = 1;

/// Largest frame body either side will accept
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Frame kind bytes
pub const FRAME_HELLO: u8 = 0x00;
pub const FRAME_SUBSCRIBE: u8 = 0x01;
pub const FRAME_UNSUBSCRIBE: u8 = 0x02;
pub const FRAME_MESSAGE: u8 = 0x03;
