use super::layout::PieceLayout;
use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};

async fn write_file(path: PathBuf, chunks: Vec<Bytes>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = File::create(&path).await?;
    for chunk in chunks {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    debug!(path = %path.display(), "file written");

    Ok(())
}

/// Writes every file of the torrent, zero-length ones included.
#[instrument(skip_all)]
pub async fn write_files(
    layout: &PieceLayout,
    paths: Vec<PathBuf>,
    pieces: &[Bytes],
) -> std::io::Result<()> {
    let writes = paths.into_iter().enumerate().map(|(file_idx, path)| {
        let chunks = layout
            .file_pieces(file_idx)
            .into_iter()
            .map(|(piece, range)| pieces[piece].slice(range))
            .collect();

        write_file(path, chunks)
    });

    try_join_all(writes).await?;

    Ok(())
}

/// Opens files that exist with the expected length, `None` for the rest.
async fn open_existing(layout: &PieceLayout, paths: &[PathBuf]) -> Vec<Option<File>> {
    let mut files = Vec::with_capacity(paths.len());

    for (file_idx, path) in paths.iter().enumerate() {
        let file = match fs::metadata(path).await {
            Ok(meta) if meta.is_file() && meta.len() == layout.file_length(file_idx) => {
                File::open(path).await.ok()
            }
            _ => None,
        };

        files.push(file);
    }

    files
}

/// Reads back whatever pieces are fully present under `paths`.
/// Contents are not verified here.
pub async fn read_pieces(
    layout: &PieceLayout,
    paths: &[PathBuf],
    piece_count: usize,
) -> std::io::Result<Vec<Option<Bytes>>> {
    let mut files = open_existing(layout, paths).await;
    let mut pieces = Vec::with_capacity(piece_count);

    'pieces: for idx in 0..piece_count {
        let spans = layout.piece_spans(idx);
        let mut piece = BytesMut::zeroed(spans.iter().map(|s| s.length).sum());

        for span in spans {
            let Some(file) = files[span.file_idx].as_mut() else {
                pieces.push(None);
                continue 'pieces;
            };

            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.read_exact(&mut piece[span.piece_offset..span.piece_offset + span.length])
                .await?;
        }

        pieces.push(Some(piece.freeze()));
    }

    Ok(pieces)
}
