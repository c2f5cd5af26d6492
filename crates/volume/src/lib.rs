//! The on-disk half of the index: block stores and buffered block I/O, the
//! pinned page cache, the index page map, chapter page codecs, the circular
//! volume itself, and the super-block/save-slot layout.

pub mod index_page_map;
pub mod io;
pub mod layout;
pub mod page_cache;
pub mod record_page;
pub mod volume;

pub use index_page_map::IndexPageMap;
pub use io::{BufferedReader, BufferedWriter, FileStore, IoFactory, MemoryStore};
pub use layout::{GeometryBlock, IndexLayout, SaveHeader};
pub use page_cache::{PageCache, PinnedPage};
pub use volume::Volume;
