//! USB Video Class streaming driver: reassembles isochronous/bulk payload
//! transfers into video frames in a shared ring buffer.
//!
//! Descriptor parsing and the USB host controller are external: formats
//! arrive pre-parsed in a [`FormatCatalog`], transfers go out through a
//! [`Transport`] and come back via [`VideoStream::on_transfer_complete`].

pub mod protocol;
pub mod stream;
pub mod uvc;
pub mod video_buffer;

pub use protocol::{FrameNotification, FrameStatus, PixelFormat, TransferStatus, VideoFormat};
pub use stream::pool::{TransferRequest, Transport};
pub use stream::{StreamingState, VideoStream};
pub use uvc::format::FormatCatalog;
pub use video_buffer::{FrameRing, VideoBuffer};
