use crate::transcoding::metainfo::Info;
use std::ops::Range;

/// Part of a piece that lives in one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file_idx: usize,
    pub file_offset: u64,
    pub piece_offset: usize,
    pub length: usize,
}

/// Maps the concatenated byte stream of a torrent onto its files.
#[derive(Debug, Clone)]
pub struct PieceLayout {
    piece_length: u64,
    total_length: u64,
    file_starts: Vec<u64>,
    file_lengths: Vec<u64>,
}

impl PieceLayout {
    pub fn new(info: &Info) -> Self {
        let file_lengths: Vec<u64> = info.files().iter().map(|f| f.length).collect();
        let file_starts = file_lengths
            .iter()
            .scan(0u64, |start, len| {
                let file_start = *start;
                *start += len;
                Some(file_start)
            })
            .collect();

        Self {
            piece_length: info.piece_length,
            total_length: info.length(),
            file_starts,
            file_lengths,
        }
    }

    pub fn file_count(&self) -> usize {
        self.file_lengths.len()
    }

    pub fn file_length(&self, file_idx: usize) -> u64 {
        self.file_lengths[file_idx]
    }

    fn piece_bounds(&self, idx: usize) -> Range<u64> {
        let start = std::cmp::min(idx as u64 * self.piece_length, self.total_length);
        let end = std::cmp::min(start + self.piece_length, self.total_length);

        start..end
    }

    pub fn piece_spans(&self, idx: usize) -> Vec<FileSpan> {
        let bounds = self.piece_bounds(idx);
        FilesInBounds::new(self, bounds.start, bounds.end).collect()
    }

    /// Pieces covering a file, with the byte range each contributes.
    pub fn file_pieces(&self, file_idx: usize) -> Vec<(usize, Range<usize>)> {
        let start = self.file_starts[file_idx];
        let end = start + self.file_lengths[file_idx];

        if start == end {
            return Vec::new();
        }

        let first = (start / self.piece_length) as usize;
        let last = ((end - 1) / self.piece_length) as usize;

        (first..=last)
            .map(|piece| {
                let bounds = self.piece_bounds(piece);
                let from = std::cmp::max(start, bounds.start) - bounds.start;
                let to = std::cmp::min(end, bounds.end) - bounds.start;

                (piece, from as usize..to as usize)
            })
            .collect()
    }
}

/// Non-empty files intersecting `[start_byte, end_byte)` of the stream.
struct FilesInBounds<'a> {
    layout: &'a PieceLayout,
    start_byte: u64,
    end_byte: u64,
    cur_idx: usize,
}

impl<'a> FilesInBounds<'a> {
    fn new(layout: &'a PieceLayout, start_byte: u64, end_byte: u64) -> Self {
        let cur_idx = layout
            .file_starts
            .iter()
            .zip(layout.file_lengths.iter())
            .position(|(start, len)| start + len > start_byte)
            .unwrap_or(layout.file_count());

        Self {
            layout,
            start_byte,
            end_byte,
            cur_idx,
        }
    }
}

impl<'a> Iterator for FilesInBounds<'a> {
    type Item = FileSpan;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cur_idx < self.layout.file_count() {
            let file_idx = self.cur_idx;
            self.cur_idx += 1;

            let file_start = self.layout.file_starts[file_idx];
            let file_end = file_start + self.layout.file_lengths[file_idx];

            if file_start >= self.end_byte {
                self.cur_idx = self.layout.file_count();
                return None;
            }

            if file_start == file_end {
                continue;
            }

            let span_start = std::cmp::max(self.start_byte, file_start);
            let span_end = std::cmp::min(self.end_byte, file_end);

            return Some(FileSpan {
                file_idx,
                file_offset: span_start - file_start,
                piece_offset: (span_start - self.start_byte) as usize,
                length: (span_end - span_start) as usize,
            });
        }

        None
    }
}
