//! Replays the patch files of one field of one segment.
//!
//! Files are merged k-way by `(doc_id, rank)`. When several files update the
//! same document, the one with the highest rank (operation id, then source
//! segment id) wins and the others are consumed silently, so the output
//! does not depend on the order in which files were registered.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::{Result, TesseraError};
use crate::patch::file::PatchFileData;
use crate::patch::finder::PatchFileInfo;
use crate::schema::{AttributeValue, FieldType};
use crate::segment::id::{DocId, OperationId, SegmentId};
use crate::storage::Storage;

/// Lifecycle of an [`AttributePatchReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Init,
    HasPatchFiles,
    Iterating,
    Exhausted,
}

/// Header of one record returned by [`AttributePatchReader::next`]. The
/// value bytes are in the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRecord {
    pub doc_id: DocId,
    pub is_null: bool,
    pub len: usize,
}

#[derive(Debug)]
struct PatchCursor {
    data: PatchFileData,
    position: usize,
}

impl PatchCursor {
    fn rank(&self) -> (OperationId, SegmentId) {
        (self.data.name.operation_id, self.data.name.src_segment_id)
    }

    fn head(&self) -> Option<DocId> {
        self.data.doc_ids().get(self.position).copied()
    }
}

type HeapKey = Reverse<(DocId, Reverse<(OperationId, SegmentId)>, usize)>;

#[derive(Debug)]
pub struct AttributePatchReader {
    segment_id: SegmentId,
    field_type: FieldType,
    cursors: Vec<PatchCursor>,
    heap: BinaryHeap<HeapKey>,
    state: ReaderState,
    scratch: Vec<u8>,
}

impl AttributePatchReader {
    /// A reader for patches targeting `segment_id`, yielding values of
    /// `field_type`.
    pub fn new(segment_id: SegmentId, field_type: FieldType) -> Self {
        AttributePatchReader {
            segment_id,
            field_type,
            cursors: Vec::new(),
            heap: BinaryHeap::new(),
            state: ReaderState::Init,
            scratch: Vec::new(),
        }
    }

    /// Build a reader over every file in `infos`.
    pub fn open(
        storage: &dyn Storage,
        segment_id: SegmentId,
        field_type: FieldType,
        infos: &[PatchFileInfo],
    ) -> Result<Self> {
        let mut reader = AttributePatchReader::new(segment_id, field_type);
        for info in infos {
            reader.add_patch_file(storage, &info.path, info.src_segment_id())?;
        }
        Ok(reader)
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn file_count(&self) -> usize {
        self.cursors.len()
    }

    /// Register a patch file written by `src_segment_id`.
    pub fn add_patch_file(
        &mut self,
        storage: &dyn Storage,
        path: &str,
        src_segment_id: SegmentId,
    ) -> Result<()> {
        if matches!(self.state, ReaderState::Iterating | ReaderState::Exhausted) {
            return Err(TesseraError::invalid_operation(
                "cannot add patch files after iteration started",
            ));
        }

        let data = PatchFileData::load(storage, path)?;
        if data.name.src_segment_id != src_segment_id
            || data.name.target_segment_id != self.segment_id
        {
            return Err(TesseraError::corrupt(format!(
                "{path} holds a patch from {} to {}, expected {src_segment_id} to {}",
                data.name.src_segment_id, data.name.target_segment_id, self.segment_id
            )));
        }
        let cursor = PatchCursor { data, position: 0 };
        if self.cursors.iter().any(|c| c.rank() == cursor.rank()) {
            return Err(TesseraError::invalid_argument(format!(
                "{path} duplicates an already registered patch generation"
            )));
        }

        self.cursors.push(cursor);
        self.state = ReaderState::HasPatchFiles;
        Ok(())
    }

    fn start(&mut self) {
        if matches!(self.state, ReaderState::Init | ReaderState::HasPatchFiles) {
            self.rebuild_heap();
            self.state = ReaderState::Iterating;
        }
    }

    fn rebuild_heap(&mut self) {
        self.heap = self
            .cursors
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.head().map(|doc| Reverse((doc, Reverse(c.rank()), i))))
            .collect();
    }

    fn advance(&mut self, index: usize) {
        let cursor = &mut self.cursors[index];
        cursor.position += 1;
        if let Some(doc) = cursor.head() {
            let rank = cursor.rank();
            self.heap.push(Reverse((doc, Reverse(rank), index)));
        }
    }

    /// Pop the winning record of the smallest pending doc id, consuming the
    /// losers. Returns `(doc_id, cursor index, record index)`.
    fn pop_winner(&mut self) -> Option<(DocId, usize, usize)> {
        let Reverse((doc_id, _, winner)) = self.heap.pop()?;
        let record = self.cursors[winner].position;
        self.advance(winner);
        while let Some(&Reverse((next_doc, _, loser))) = self.heap.peek() {
            if next_doc != doc_id {
                break;
            }
            self.heap.pop();
            self.advance(loser);
        }
        Some((doc_id, winner, record))
    }

    /// Value bytes of a record converted to this reader's type.
    fn encoded_value(&mut self, cursor: usize, record: usize) -> Result<Option<&[u8]>> {
        let data = &self.cursors[cursor].data;
        let Some(bytes) = data.value_bytes(record) else {
            return Ok(None);
        };
        if data.field_type() == self.field_type {
            self.scratch.clear();
            self.scratch.extend_from_slice(bytes);
        } else {
            let value = AttributeValue::decode(data.field_type(), bytes)?
                .convert_to(self.field_type)?;
            self.scratch = value.to_bytes();
        }
        Ok(Some(&self.scratch))
    }

    fn emit(
        &mut self,
        doc_id: DocId,
        cursor: usize,
        record: usize,
        buffer: &mut [u8],
    ) -> Result<PatchRecord> {
        match self.encoded_value(cursor, record)? {
            None => Ok(PatchRecord {
                doc_id,
                is_null: true,
                len: 0,
            }),
            Some(bytes) => {
                if bytes.len() > buffer.len() {
                    return Err(TesseraError::invalid_argument(format!(
                        "patch value of {} bytes does not fit a {} byte buffer",
                        bytes.len(),
                        buffer.len()
                    )));
                }
                let len = bytes.len();
                buffer[..len].copy_from_slice(bytes);
                Ok(PatchRecord {
                    doc_id,
                    is_null: false,
                    len,
                })
            }
        }
    }

    /// Next winning record in increasing doc id order, `None` once
    /// exhausted.
    pub fn next(&mut self, buffer: &mut [u8]) -> Result<Option<PatchRecord>> {
        self.start();
        match self.pop_winner() {
            Some((doc_id, cursor, record)) => self.emit(doc_id, cursor, record, buffer).map(Some),
            None => {
                self.state = ReaderState::Exhausted;
                Ok(None)
            }
        }
    }

    /// Like [`AttributePatchReader::next`] but decodes the value.
    pub fn next_value(&mut self) -> Result<Option<(DocId, Option<AttributeValue>)>> {
        self.start();
        let Some((doc_id, cursor, record)) = self.pop_winner() else {
            self.state = ReaderState::Exhausted;
            return Ok(None);
        };
        let field_type = self.field_type;
        let value = self
            .encoded_value(cursor, record)?
            .map(|bytes| AttributeValue::decode(field_type, bytes))
            .transpose()?;
        Ok(Some((doc_id, value)))
    }

    /// Jump to `doc_id` and return its winning record, if any.
    ///
    /// Every record before `doc_id` is consumed. Doc ids behind the
    /// consumed position are never found again.
    pub fn seek(&mut self, doc_id: DocId, buffer: &mut [u8]) -> Result<Option<PatchRecord>> {
        self.start();
        if self.state == ReaderState::Exhausted {
            return Ok(None);
        }

        let mut winner: Option<(usize, usize)> = None;
        let mut best_rank = None;
        for (index, cursor) in self.cursors.iter_mut().enumerate() {
            cursor.position = cursor.data.lower_bound(cursor.position, doc_id);
            if cursor.head() == Some(doc_id) {
                let rank = cursor.rank();
                if best_rank.is_none_or(|best| rank > best) {
                    best_rank = Some(rank);
                    winner = Some((index, cursor.position));
                }
                cursor.position += 1;
            }
        }
        self.rebuild_heap();
        if self.heap.is_empty() {
            self.state = ReaderState::Exhausted;
        }

        match winner {
            Some((cursor, record)) => self.emit(doc_id, cursor, record, buffer).map(Some),
            None => Ok(None),
        }
    }
}
