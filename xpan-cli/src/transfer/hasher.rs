use std::io;
use std::path::Path;

use md5::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_BUFFER: usize = 1024 * 1024;

/// The digests the provider keys content on. `slice_md5` covers only the
/// first slice-sized prefix and exists purely for rapid-upload matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub md5: String,
    pub slice_md5: String,
    pub crc32: u32,
    pub size: u64,
}

/// Single sequential pass over `reader` feeding every digester at once:
/// whole-file md5, prefix md5, crc32, a size counter, and one md5 per
/// `chunk_size` block. The reader is never rewound.
pub async fn digest_reader<R: AsyncRead + Unpin>(
    mut reader: R,
    slice_size: u64,
    chunk_size: u64,
) -> io::Result<(FileDigest, Vec<String>)> {
    let chunk_size = chunk_size.max(1);
    let mut buf = vec![0u8; READ_BUFFER];

    let mut whole = Context::new();
    let mut slice = Context::new();
    let mut crc = crc32fast::Hasher::new();
    let mut size = 0u64;

    let mut blocks = Vec::new();
    let mut block = Context::new();
    let mut block_filled = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let data = &buf[..n];

        whole.consume(data);
        crc.update(data);

        if size < slice_size {
            let take = ((slice_size - size) as usize).min(data.len());
            slice.consume(&data[..take]);
        }

        let mut remaining = data;
        while !remaining.is_empty() {
            let take = ((chunk_size - block_filled) as usize).min(remaining.len());
            block.consume(&remaining[..take]);
            block_filled += take as u64;
            remaining = &remaining[take..];
            if block_filled == chunk_size {
                blocks.push(format!("{:x}", block.compute()));
                block = Context::new();
                block_filled = 0;
            }
        }

        size += n as u64;
    }

    if block_filled > 0 {
        blocks.push(format!("{:x}", block.compute()));
    }

    Ok((
        FileDigest {
            md5: format!("{:x}", whole.compute()),
            slice_md5: format!("{:x}", slice.compute()),
            crc32: crc.finalize(),
            size,
        },
        blocks,
    ))
}

pub async fn digest_file(
    path: &Path,
    slice_size: u64,
    chunk_size: u64,
) -> io::Result<(FileDigest, Vec<String>)> {
    let file = tokio::fs::File::open(path).await?;
    digest_reader(file, slice_size, chunk_size).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn digest_bytes(data: &[u8], slice_size: u64, chunk_size: u64) -> (FileDigest, Vec<String>) {
        digest_reader(data, slice_size, chunk_size).await.unwrap()
    }

    #[tokio::test]
    async fn empty_input_yields_well_defined_digests() {
        let (digest, blocks) = digest_bytes(b"", 256, 4).await;
        assert_eq!(digest.size, 0);
        assert_eq!(digest.md5, format!("{:x}", md5::compute(b"")));
        assert_eq!(digest.slice_md5, digest.md5);
        assert_eq!(digest.crc32, crc32fast::hash(b""));
        assert!(blocks.is_empty());
    }

    #[tokio::test]
    async fn slice_md5_covers_only_the_prefix() {
        let data = b"0123456789abcdef";
        let (digest, _) = digest_bytes(data, 4, 1024).await;
        assert_eq!(digest.slice_md5, format!("{:x}", md5::compute(b"0123")));
        assert_eq!(digest.md5, format!("{:x}", md5::compute(data)));
        assert_eq!(digest.crc32, crc32fast::hash(data));
        assert_eq!(digest.size, data.len() as u64);
    }

    #[tokio::test]
    async fn block_list_splits_on_chunk_boundaries() {
        let data = b"abcdefgh";

        // exactly two chunks
        let (_, blocks) = digest_bytes(data, 256, 4).await;
        assert_eq!(
            blocks,
            vec![
                format!("{:x}", md5::compute(b"abcd")),
                format!("{:x}", md5::compute(b"efgh")),
            ]
        );

        // one byte over a chunk
        let (_, blocks) = digest_bytes(b"abcdefghi", 256, 4).await;
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2], format!("{:x}", md5::compute(b"i")));

        // one byte under a chunk
        let (_, blocks) = digest_bytes(b"abc", 256, 4).await;
        assert_eq!(blocks, vec![format!("{:x}", md5::compute(b"abc"))]);
    }

    #[tokio::test]
    async fn file_digest_matches_reader_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let payload = vec![7u8; 5000];
        std::fs::write(&path, &payload).unwrap();

        let (from_file, blocks_file) = digest_file(&path, 256, 1024).await.unwrap();
        let (from_reader, blocks_reader) = digest_bytes(&payload, 256, 1024).await;

        assert_eq!(from_file, from_reader);
        assert_eq!(blocks_file, blocks_reader);
        assert_eq!(blocks_file.len(), 5);
    }
}
