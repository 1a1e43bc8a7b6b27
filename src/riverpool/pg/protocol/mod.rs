mod tag;
mod message;
mod message_reader;
mod message_builder;
mod message_error_builder;
mod errors;
pub mod error_codes;
mod startup;
mod server_params;
mod row_description;
pub mod framer;

pub use self::tag::Tag;
pub use self::message::Message;
pub use self::message_reader::MessageReader;
pub use self::message_builder::MessageBuilder;
pub use self::message_error_builder::MessageErrorBuilder;
pub use self::errors::{ErrorSeverity, ErrorFieldTag, ErrorFields};
pub use self::startup::{ProtocolVersion, StartupPacket, SSL_REQUEST, CANCEL_REQUEST_CODE, PROTOCOL_V2, PROTOCOL_V3};
pub use self::server_params::ServerParams;
pub use self::row_description::{RowDescription, FieldDescription};
pub use self::framer::{Header, decode_header, read_payload, read_message, encode, encode_and_send, write_message};
