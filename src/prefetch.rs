//! Double-buffered photo pipeline over a circular cursor.
//!
//! Two slot lists live in a fixed two-element array and a role index says
//! which one is shown. New batches are decoded into a private vector and
//! only committed, together with the cursor, once the whole batch is
//! ready; a cancelled operation leaves every field untouched.
//!
//! The buffer in the "next" role holds photos handed back by
//! [`PrefetchBuffer::shrink_by`]. The cursor is rewound past them, so the
//! next prefetch or grow takes them first instead of decoding them again.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::GridConfig;
use crate::decoder::{DecodedImage, ImageDecoder, TargetBound};
use crate::error::Cancelled;
use crate::index::{IndexOptions, PhotoIndex};
use crate::source::{PhotoId, PhotoSource};

/// One grid position: a decoded photo, or absent.
pub type Slot = Option<Arc<DecodedImage>>;

#[derive(Debug, Clone, Copy)]
pub struct PrefetchOptions {
    pub index: IndexOptions,
    pub decoder: ImageDecoder,
    pub target_bound: Option<TargetBound>,
    pub max_in_flight: usize,
}

impl Default for PrefetchOptions {
    fn default() -> Self {
        Self {
            index: IndexOptions::default(),
            decoder: ImageDecoder::default(),
            target_bound: None,
            max_in_flight: 4,
        }
    }
}

impl PrefetchOptions {
    pub fn from_config(cfg: &GridConfig) -> Self {
        Self {
            index: cfg.index,
            decoder: ImageDecoder::new(cfg.exif_orientation),
            target_bound: None,
            max_in_flight: cfg.max_concurrent_decodes,
        }
    }
}

pub struct PrefetchBuffer {
    source: Option<Arc<dyn PhotoSource>>,
    options: PrefetchOptions,
    index: PhotoIndex,
    available: bool,
    cursor: usize,
    buffers: [Vec<Slot>; 2],
    live: usize,
}

impl PrefetchBuffer {
    /// `None` means no source is configured; every slot will be absent.
    pub fn new(source: Option<Arc<dyn PhotoSource>>, options: PrefetchOptions) -> Self {
        Self {
            source,
            options,
            index: PhotoIndex::default(),
            available: false,
            cursor: 0,
            buffers: [Vec::new(), Vec::new()],
            live: 0,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    /// False when no source is configured or the last index build failed.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Decode size hint for subsequent batches, usually one grid cell.
    pub fn set_target_bound(&mut self, bound: Option<TargetBound>) {
        self.options.target_bound = bound;
    }

    /// The shown slots, without copying the photos.
    pub fn snapshot(&self) -> Vec<Slot> {
        self.buffers[self.live].clone()
    }

    pub fn live_len(&self) -> usize {
        self.buffers[self.live].len()
    }

    /// Photos handed back by a shrink and waiting to be shown again.
    pub fn staged(&self) -> &[Slot] {
        &self.buffers[self.next_role()]
    }

    /// Drops both buffers; the index and cursor are kept.
    pub fn release(&mut self) {
        self.buffers = [Vec::new(), Vec::new()];
    }

    fn next_role(&self) -> usize {
        1 - self.live
    }

    /// Rebuilds the index from the source and resets the cursor.
    ///
    /// An unreachable source leaves an empty, unavailable index.
    pub async fn load_index(&mut self, cancel: &CancellationToken) -> Result<usize, Cancelled> {
        let built = match self.source.clone() {
            None => {
                debug!("no source configured");
                None
            }
            Some(source) => {
                let options = self.options.index;
                let build =
                    tokio::task::spawn_blocking(move || PhotoIndex::build(source.as_ref(), options));
                let joined = select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Cancelled),
                    joined = build => joined,
                };
                match joined {
                    Ok(Ok(index)) => Some(index),
                    Ok(Err(err)) => {
                        warn!("{err}; showing the empty state");
                        None
                    }
                    Err(err) => {
                        warn!("index build task failed: {err}");
                        None
                    }
                }
            }
        };

        self.available = built.is_some();
        self.index = built.unwrap_or_default();
        self.cursor = 0;
        let next = self.next_role();
        self.buffers[next].clear();
        Ok(self.index.len())
    }

    /// Decodes `count` photos from the cursor and swaps them in as the
    /// shown buffer. Returns the new shown contents.
    pub async fn prefetch_next(
        &mut self,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Slot>, Cancelled> {
        let next = self.next_role();
        let reused = count.min(self.buffers[next].len());
        let start = self.advance(self.cursor, reused);
        let (ids, cursor) = self.plan(start, count - reused);
        let decoded = self.decode_batch(ids, count - reused, cancel).await?;

        let mut staged = std::mem::take(&mut self.buffers[next]).into_iter();
        let mut fresh = Vec::with_capacity(count);
        fresh.extend(staged.by_ref().take(reused));
        fresh.extend(decoded);
        let leftover: Vec<Slot> = staged.collect();

        let retired = self.live;
        self.buffers[next] = fresh;
        self.live = next;
        // The old shown buffer now plays "next"; only leftovers stay staged.
        self.buffers[retired] = leftover;
        self.cursor = cursor;
        debug!(count, reused, cursor, "swapped in next batch");
        Ok(self.snapshot())
    }

    /// Appends `count` photos to the shown buffer, continuing from the
    /// cursor. Staged photos are used first.
    pub async fn grow_by(
        &mut self,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Slot>, Cancelled> {
        let next = self.next_role();
        let reused = count.min(self.buffers[next].len());
        let start = self.advance(self.cursor, reused);
        let (ids, cursor) = self.plan(start, count - reused);
        let decoded = self.decode_batch(ids, count - reused, cancel).await?;

        let staged: Vec<Slot> = self.buffers[next].drain(..reused).collect();
        let live = &mut self.buffers[self.live];
        live.extend(staged);
        live.extend(decoded);
        self.cursor = cursor;
        debug!(count, reused, cursor, len = live.len(), "grew shown buffer");
        Ok(self.snapshot())
    }

    /// Hands the last `count` shown photos back to the front of the staged
    /// list, in order, and rewinds the cursor by as many as were moved.
    pub fn shrink_by(&mut self, count: usize) {
        let live_len = self.buffers[self.live].len();
        let moved = count.min(live_len);
        let mut tail = self.buffers[self.live].split_off(live_len - moved);
        let next = self.next_role();
        tail.append(&mut self.buffers[next]);
        self.buffers[next] = tail;
        self.cursor = self.rewind(self.cursor, moved);
        debug!(
            count,
            moved,
            cursor = self.cursor,
            staged = self.buffers[next].len(),
            "shrank shown buffer"
        );
    }

    fn advance(&self, cursor: usize, by: usize) -> usize {
        match self.index.len() {
            0 => 0,
            len => (cursor + by % len) % len,
        }
    }

    fn rewind(&self, cursor: usize, by: usize) -> usize {
        match self.index.len() {
            0 => 0,
            len => (cursor + len - by % len) % len,
        }
    }

    /// Identifiers for `count` positions starting at `start`, and the
    /// cursor after them. Wraps to 0 exactly when the end is reached.
    fn plan(&self, start: usize, count: usize) -> (Vec<PhotoId>, usize) {
        let len = self.index.len();
        if len == 0 {
            return (Vec::new(), 0);
        }
        let mut cursor = start;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(id) = self.index.get(cursor) {
                ids.push(id.clone());
            }
            cursor += 1;
            if cursor == len {
                cursor = 0;
            }
        }
        (ids, cursor)
    }

    /// Decodes `ids` with bounded concurrency, keeping request order.
    /// Pads to `count` absent slots when the index had nothing to offer.
    async fn decode_batch(
        &self,
        ids: Vec<PhotoId>,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Slot>, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let Some(source) = self.source.clone() else {
            return Ok(vec![None; count]);
        };
        if ids.is_empty() {
            return Ok(vec![None; count]);
        }

        let decoder = self.options.decoder;
        let bound = self.options.target_bound;
        let batch = stream::iter(ids)
            .map(|id| {
                let source = Arc::clone(&source);
                async move {
                    let decoded = tokio::task::spawn_blocking(move || {
                        decoder.decode(source.as_ref(), &id, bound).map(Arc::new)
                    })
                    .await;
                    decoded.unwrap_or_else(|err| {
                        warn!("decode task failed: {err}");
                        None
                    })
                }
            })
            .buffered(self.options.max_in_flight.max(1))
            .collect::<Vec<Slot>>();

        select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            mut slots = batch => {
                slots.resize(count, None);
                Ok(slots)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::source::{SourceEntry, SourceLocation};
    use image::{ImageFormat, RgbaImage};
    use std::io::{self, Cursor};
    use std::path::PathBuf;

    struct MemorySource {
        location: SourceLocation,
        names: Vec<&'static str>,
    }

    impl MemorySource {
        fn new(names: &[&'static str]) -> Arc<dyn PhotoSource> {
            Arc::new(Self {
                location: SourceLocation::from(PathBuf::from("/memory")),
                names: names.to_vec(),
            })
        }
    }

    impl PhotoSource for MemorySource {
        fn location(&self) -> &SourceLocation {
            &self.location
        }

        fn list_images(&self) -> Result<Vec<SourceEntry>, Error> {
            Ok(self
                .names
                .iter()
                .map(|name| SourceEntry {
                    id: PhotoId::new(*name),
                    media_type: "image/png".into(),
                })
                .collect())
        }

        fn read(&self, id: &PhotoId) -> io::Result<Vec<u8>> {
            if !self.names.contains(&id.as_str()) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
            }
            let mut bytes = Cursor::new(Vec::new());
            RgbaImage::new(4, 4)
                .write_to(&mut bytes, ImageFormat::Png)
                .map_err(io::Error::other)?;
            Ok(bytes.into_inner())
        }
    }

    fn ids(slots: &[Slot]) -> Vec<&str> {
        slots
            .iter()
            .map(|slot| slot.as_ref().map_or("-", |img| img.id().as_str()))
            .collect()
    }

    async fn loaded(names: &[&'static str]) -> PrefetchBuffer {
        let mut buffer =
            PrefetchBuffer::new(Some(MemorySource::new(names)), PrefetchOptions::default());
        buffer.load_index(&CancellationToken::new()).await.unwrap();
        buffer
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn prefetch_wraps_and_swaps() {
        let cancel = CancellationToken::new();
        let mut buffer = loaded(&["A", "B", "C"]).await;

        let first = buffer.prefetch_next(2, &cancel).await.unwrap();
        assert_eq!(ids(&first), vec!["A", "B"]);
        assert_eq!(buffer.cursor(), 2);

        let second = buffer.prefetch_next(2, &cancel).await.unwrap();
        assert_eq!(ids(&second), vec!["C", "A"]);
        assert_eq!(ids(&buffer.snapshot()), vec!["C", "A"]);
        assert_eq!(buffer.cursor(), 1);
        assert!(buffer.staged().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn requests_longer_than_index_repeat() {
        let cancel = CancellationToken::new();
        let mut buffer = loaded(&["A", "B"]).await;
        let slots = buffer.prefetch_next(5, &cancel).await.unwrap();
        assert_eq!(ids(&slots), vec!["A", "B", "A", "B", "A"]);
        assert_eq!(buffer.cursor(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_index_yields_absent_slots() {
        let cancel = CancellationToken::new();
        let mut buffer = loaded(&[]).await;
        assert!(buffer.is_available());
        let slots = buffer.prefetch_next(3, &cancel).await.unwrap();
        assert_eq!(ids(&slots), vec!["-", "-", "-"]);
        assert_eq!(buffer.cursor(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_source_is_unavailable() {
        let cancel = CancellationToken::new();
        let mut buffer = PrefetchBuffer::new(None, PrefetchOptions::default());
        assert_eq!(buffer.load_index(&cancel).await.unwrap(), 0);
        assert!(!buffer.is_available());
        assert_eq!(buffer.prefetch_next(2, &cancel).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shrink_hands_photos_back_and_rewinds() {
        let cancel = CancellationToken::new();
        let mut buffer = loaded(&["A", "B", "C", "D"]).await;
        buffer.prefetch_next(4, &cancel).await.unwrap();
        assert_eq!(buffer.cursor(), 0);

        buffer.shrink_by(2);
        assert_eq!(ids(&buffer.snapshot()), vec!["A", "B"]);
        assert_eq!(ids(buffer.staged()), vec!["C", "D"]);
        assert_eq!(buffer.cursor(), 2);

        // The handed-back photos come first, then decoding resumes.
        let next = buffer.prefetch_next(3, &cancel).await.unwrap();
        assert_eq!(ids(&next), vec!["C", "D", "A"]);
        assert_eq!(buffer.cursor(), 1);
        assert!(buffer.staged().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shrink_moves_at_most_what_is_shown() {
        let cancel = CancellationToken::new();
        let mut buffer = loaded(&["A", "B", "C", "D", "E"]).await;
        buffer.prefetch_next(2, &cancel).await.unwrap();
        buffer.shrink_by(5);
        assert!(buffer.snapshot().is_empty());
        assert_eq!(ids(buffer.staged()), vec!["A", "B"]);
        assert_eq!(buffer.cursor(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn grow_then_shrink_round_trips() {
        let cancel = CancellationToken::new();
        let mut buffer = loaded(&["A", "B", "C"]).await;
        buffer.prefetch_next(2, &cancel).await.unwrap();
        let before = ids(&buffer.snapshot()).join(",");
        let cursor = buffer.cursor();

        let grown = buffer.grow_by(2, &cancel).await.unwrap();
        assert_eq!(ids(&grown), vec!["A", "B", "C", "A"]);
        buffer.shrink_by(2);
        assert_eq!(ids(&buffer.snapshot()).join(","), before);
        assert_eq!(buffer.cursor(), cursor);

        // Growing again reuses the staged photos instead of skipping them.
        let regrown = buffer.grow_by(2, &cancel).await.unwrap();
        assert_eq!(ids(&regrown), vec!["A", "B", "C", "A"]);
        assert!(buffer.staged().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_prefetch_changes_nothing() {
        let mut buffer = loaded(&["A", "B", "C"]).await;
        buffer
            .prefetch_next(2, &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(buffer.prefetch_next(2, &cancel).await, Err(Cancelled)));
        assert!(matches!(buffer.grow_by(1, &cancel).await, Err(Cancelled)));
        assert_eq!(ids(&buffer.snapshot()), vec!["A", "B"]);
        assert_eq!(buffer.cursor(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reload_resets_cursor_and_staging() {
        let cancel = CancellationToken::new();
        let mut buffer = loaded(&["A", "B", "C"]).await;
        buffer.prefetch_next(3, &cancel).await.unwrap();
        buffer.shrink_by(1);
        assert_eq!(buffer.staged().len(), 1);

        buffer.load_index(&cancel).await.unwrap();
        assert_eq!(buffer.cursor(), 0);
        assert!(buffer.staged().is_empty());
        // The shown batch stays renderable until the next swap.
        assert_eq!(ids(&buffer.snapshot()), vec!["A", "B"]);
    }
}
