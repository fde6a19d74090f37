//! Protocol constants and configuration defaults

/// Default AMI port for plain TCP connections
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Default AMI port when the manager is configured with `tlsenable=yes`
pub const DEFAULT_AMI_TLS_PORT: u16 = 5039;

/// Socket buffer size for reading from the stream (64KB)
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Buffer allocation size (64KB) - used for both initial allocation and growth increments
pub const BUF_CHUNK: usize = 64 * 1024;

/// Maximum size of a single unterminated message (4MB).
/// The largest legitimate blocks are `Command` responses for verbose CLI output.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Maximum total buffer size (16MB). Exceeding it means the peer is not speaking AMI.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Line terminator written on the wire. The parser also accepts bare `\n`.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Greeting banner prefix sent by Asterisk before any framed message
pub const BANNER_PREFIX: &str = "Asterisk Call Manager";

/// Trailer line of legacy `Response: Follows` command output
pub const END_COMMAND_MARKER: &str = "--END COMMAND--";

/// `Response:` values
pub const RESPONSE_SUCCESS: &str = "Success";
pub const RESPONSE_ERROR: &str = "Error";
pub const RESPONSE_FOLLOWS: &str = "Follows";
pub const RESPONSE_GOODBYE: &str = "Goodbye";

/// `EventList:` marker on the event that closes a list response
pub const EVENT_LIST_COMPLETE: &str = "Complete";

/// Connection timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Idle read timeout in milliseconds before a keepalive `Ping` is sent
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;

/// Default action response timeout in milliseconds
pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 10_000;

/// Delay between reconnection attempts in milliseconds
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;

/// Capacity of the lifecycle notification channel
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 1000;

/// Dialplan context used for originate when the caller does not pick one
pub const DEFAULT_CONTEXT: &str = "from-internal";

/// Extra time past an originate's dial timeout before its response is given up on
pub const ORIGINATE_RESPONSE_MARGIN_MS: u64 = 5_000;
