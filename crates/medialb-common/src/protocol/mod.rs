pub mod control;
pub mod error;
pub mod fragment;
pub mod handler;
pub mod packet;
pub mod registry;


pub use control::{
    control_fragment, ping_fragment, Control, PingValue, CODE_ERROR, CODE_OK, CODE_PING,
    CODE_PONG, CONTROL_FRAGMENT, FIRST_FRAGMENT_CODE, PING_FRAGMENT,
};
pub use error::{collect_errors, MedialbError, Result};
pub use fragment::{DecodeFn, Fragment};
pub use handler::{Handler, Request, Responder, REPLY_TIMEOUT};
pub use packet::{Code, Message, Packet};
pub use registry::{Protocol, DEFAULT_BUFFER_SIZE};
