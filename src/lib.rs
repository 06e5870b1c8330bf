pub(crate) mod process;

pub mod config;
pub use config::RtConfig;

pub mod response;
pub use response::{parse_rt_response, RtResponse, RtResponseData};

pub mod parser;
pub use parser::{
    parse_attachment_list, parse_history_list, parse_history_message, Attachment, AttachmentMeta,
    HistoryItemMeta, HistoryMessage,
};

pub mod session;
pub use session::{FetchRest, RtSession};

pub mod downloader;
pub use downloader::{download_ticket, TicketDownloader};
