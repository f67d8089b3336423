pub mod frame;
pub mod link;
pub mod mac;
pub mod probe;
pub mod ring;
pub mod server;
pub mod session;

pub use frame::{Frame, FrameType, ETHERTYPE, HDR_SIZE, MAX_PAYLOAD, MIN_FRAME};
pub use link::{bring_up, poll_read, LinkIo, RawLink, Readiness};
pub use mac::{format_mac, hexdump, parse_mac, tokenize, Mac};
pub use probe::{discover, pick_free_shelf, render_table, Filter, Shelf};
pub use ring::Backscroll;
pub use server::{ConsoleServer, IDLE_TIMER, MAX_CLIENTS};
pub use session::{
    conn_tag, escape_display, escape_from_letter, ClientSession, SessionEnd, UserTty,
    DEFAULT_ESCAPE,
};
