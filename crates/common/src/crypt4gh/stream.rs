use std::collections::VecDeque;

use async_stream::try_stream;
use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::header::{SessionMaterial, CIPHER_SEGMENT_SIZE, MAC_SIZE, NONCE_SIZE};
use super::keys::KEY_SIZE;

/// Errors raised while decrypting a ciphertext body
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("I/O error reading ciphertext body: {0}")]
    Io(#[from] std::io::Error),
    #[error("truncated ciphertext segment")]
    TruncatedSegment,
    #[error("no session key authenticates the body segment")]
    SegmentAuth,
    #[error("invalid byte range: start {0} is not below end {1}")]
    InvalidRange(u64, u64),
}

/// A half-open plaintext byte window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Result<Self, BodyError> {
        if start >= end {
            return Err(BodyError::InvalidRange(start, end));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// The window as edit-list lengths: skip `start`, keep `end - start`
    pub fn edit_lengths(&self) -> Vec<u64> {
        vec![self.start, self.end - self.start]
    }
}

/// Encrypt one plaintext segment: random nonce || ciphertext || tag
pub fn encrypt_segment(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let mut nonce = [0u8; NONCE_SIZE];
    getrandom::getrandom(&mut nonce).expect("failed to generate random bytes");
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .expect("segment encryption cannot fail");
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt one segment, trying each recovered session key in order
fn decrypt_segment(keys: &[[u8; KEY_SIZE]], segment: &[u8]) -> Result<Vec<u8>, BodyError> {
    if segment.len() < NONCE_SIZE + MAC_SIZE {
        return Err(BodyError::TruncatedSegment);
    }
    let nonce = Nonce::from_slice(&segment[..NONCE_SIZE]);
    for key in keys {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        if let Ok(plaintext) = cipher.decrypt(nonce, &segment[NONCE_SIZE..]) {
            return Ok(plaintext);
        }
    }
    Err(BodyError::SegmentAuth)
}

/// Skip/keep state machine over the plaintext stream
///
/// Lengths alternate starting with a skip. An odd-length list ends on a
/// skip, after which everything to EOF is kept; an even-length list ends
/// on a keep, after which nothing more is emitted.
struct EditFilter {
    pending: VecDeque<u64>,
    keeping: bool,
    keep_tail: bool,
}

impl EditFilter {
    fn new(lengths: Vec<u64>) -> Self {
        let keep_tail = lengths.len() % 2 == 1;
        Self {
            pending: lengths.into(),
            keeping: false,
            keep_tail,
        }
    }

    fn pass_through() -> Self {
        Self {
            pending: VecDeque::new(),
            keeping: false,
            keep_tail: true,
        }
    }

    /// Push a plaintext chunk through the filter, appending kept bytes
    fn apply(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        let mut offset = 0usize;
        while offset < chunk.len() {
            let Some(run) = self.pending.front_mut() else {
                if self.keep_tail {
                    out.extend_from_slice(&chunk[offset..]);
                }
                return;
            };
            if *run == 0 {
                self.pending.pop_front();
                self.keeping = !self.keeping;
                continue;
            }
            let take = (*run).min((chunk.len() - offset) as u64) as usize;
            if self.keeping {
                out.extend_from_slice(&chunk[offset..offset + take]);
            }
            *run -= take as u64;
            offset += take;
        }
    }

    /// True once the filter can never emit another byte
    fn exhausted(&self) -> bool {
        if self.keep_tail {
            return false;
        }
        match self.pending.len() {
            0 => true,
            1 => !self.keeping,
            _ => false,
        }
    }

    /// True when the next `len` plaintext bytes fall entirely inside the
    /// current skip run, so the segment need not be decrypted at all
    fn skips_entirely(&self, len: u64) -> bool {
        if self.keeping || len == 0 {
            return false;
        }
        match self.pending.front() {
            Some(&run) => run >= len,
            None => !self.keep_tail,
        }
    }

    /// Advance across `len` skipped bytes without output
    fn consume_skip(&mut self, len: u64) {
        if let Some(run) = self.pending.front_mut() {
            *run -= (*run).min(len);
            if *run == 0 {
                self.pending.pop_front();
                self.keeping = !self.keeping;
            }
        }
    }
}

/// Lazily decrypt a ciphertext body
///
/// Produces plaintext chunks one segment at a time; never buffers the
/// body. An explicit `range` takes precedence over an edit list carried in
/// the header. The stream ends early once the requested window has been
/// emitted, and whole segments outside the window are skipped without
/// being decrypted. Single-pass — the stream is not restartable.
pub fn decrypt_body<R>(
    mut reader: R,
    material: SessionMaterial,
    range: Option<ByteRange>,
) -> impl Stream<Item = Result<Bytes, BodyError>> + Send
where
    R: AsyncRead + Send + Unpin + 'static,
{
    try_stream! {
        let lengths = match range {
            Some(range) => Some(range.edit_lengths()),
            None => material.edit_list.clone(),
        };
        let mut filter = match lengths {
            Some(lengths) => EditFilter::new(lengths),
            None => EditFilter::pass_through(),
        };

        let mut segment = vec![0u8; CIPHER_SEGMENT_SIZE];
        while !filter.exhausted() {
            let n = read_full(&mut reader, &mut segment).await?;
            if n == 0 {
                break;
            }
            if n < NONCE_SIZE + MAC_SIZE {
                Err(BodyError::TruncatedSegment)?;
            }
            let plain_len = (n - NONCE_SIZE - MAC_SIZE) as u64;
            if filter.skips_entirely(plain_len) {
                filter.consume_skip(plain_len);
                continue;
            }
            let plaintext = decrypt_segment(&material.session_keys, &segment[..n])?;
            let mut out = Vec::with_capacity(plaintext.len());
            filter.apply(&plaintext, &mut out);
            if !out.is_empty() {
                yield Bytes::from(out);
            }
        }
    }
}

/// Fill `buf` as far as the reader allows; short only at EOF
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use futures::StreamExt;

    use super::super::header::SEGMENT_SIZE;
    use super::*;

    fn filter_output(lengths: Vec<u64>, chunks: &[&[u8]]) -> Vec<u8> {
        let mut filter = EditFilter::new(lengths);
        let mut out = Vec::new();
        for chunk in chunks {
            filter.apply(chunk, &mut out);
        }
        out
    }

    #[test]
    fn test_filter_skip_then_keep() {
        assert_eq!(filter_output(vec![2, 3], &[b"abcdefgh"]), b"cde");
    }

    #[test]
    fn test_filter_across_chunks() {
        assert_eq!(filter_output(vec![4, 6], &[b"abc", b"defgh", b"ijkl"]), b"efghij");
    }

    #[test]
    fn test_filter_odd_list_keeps_tail() {
        assert_eq!(filter_output(vec![3], &[b"abcdef", b"gh"]), b"defgh");
        assert_eq!(filter_output(vec![1, 2, 1], &[b"abcdefg"]), b"bcefg");
    }

    #[test]
    fn test_filter_even_list_drops_tail() {
        assert_eq!(filter_output(vec![1, 2], &[b"abcdefg"]), b"bc");
    }

    #[test]
    fn test_filter_exhaustion() {
        let mut filter = EditFilter::new(vec![1, 2]);
        let mut out = Vec::new();
        filter.apply(b"abcd", &mut out);
        assert!(filter.exhausted());

        let filter = EditFilter::new(vec![1, 2, 3]);
        assert!(!filter.exhausted());
    }

    #[test]
    fn test_range_edit_lengths() {
        let range = ByteRange::new(100, 250).unwrap();
        assert_eq!(range.edit_lengths(), vec![100, 150]);
        assert!(ByteRange::new(5, 5).is_err());
        assert!(ByteRange::new(9, 3).is_err());
    }

    fn encrypt_body(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        for segment in plaintext.chunks(SEGMENT_SIZE) {
            body.extend_from_slice(&encrypt_segment(key, segment));
        }
        body
    }

    async fn collect(
        stream: impl Stream<Item = Result<Bytes, BodyError>> + Send,
    ) -> Vec<u8> {
        let mut stream = Box::pin(stream);
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    fn material(key: [u8; KEY_SIZE]) -> SessionMaterial {
        SessionMaterial {
            session_keys: vec![key],
            edit_list: None,
        }
    }

    #[tokio::test]
    async fn test_decrypt_body_full() {
        let mut key = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut key).unwrap();
        let plaintext: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let body = encrypt_body(&key, &plaintext);

        let out = collect(decrypt_body(Cursor::new(body), material(key), None)).await;
        assert_eq!(out, plaintext);
    }

    #[tokio::test]
    async fn test_decrypt_body_range_across_segments() {
        let mut key = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut key).unwrap();
        let plaintext: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let body = encrypt_body(&key, &plaintext);

        // window straddling the first segment boundary, unaligned ends
        let range = ByteRange::new(65_000, 70_123).unwrap();
        let out = collect(decrypt_body(
            Cursor::new(body.clone()),
            material(key),
            Some(range),
        ))
        .await;
        assert_eq!(out, &plaintext[65_000..70_123]);

        // requesting the same window twice yields identical bytes
        let again = collect(decrypt_body(Cursor::new(body), material(key), Some(range))).await;
        assert_eq!(out, again);
    }

    #[tokio::test]
    async fn test_decrypt_body_full_range_equals_no_range() {
        let mut key = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut key).unwrap();
        let plaintext: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        let body = encrypt_body(&key, &plaintext);

        let range = ByteRange::new(0, plaintext.len() as u64).unwrap();
        let ranged = collect(decrypt_body(
            Cursor::new(body.clone()),
            material(key),
            Some(range),
        ))
        .await;
        let full = collect(decrypt_body(Cursor::new(body), material(key), None)).await;
        assert_eq!(ranged, full);
        assert_eq!(ranged, plaintext);
    }

    #[tokio::test]
    async fn test_decrypt_body_header_edit_list() {
        let mut key = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut key).unwrap();
        let plaintext: Vec<u8> = (0..10_000u32).map(|i| (i % 211) as u8).collect();
        let body = encrypt_body(&key, &plaintext);

        let material = SessionMaterial {
            session_keys: vec![key],
            edit_list: Some(vec![500, 1000]),
        };
        let out = collect(decrypt_body(Cursor::new(body), material, None)).await;
        assert_eq!(out, &plaintext[500..1500]);
    }

    #[tokio::test]
    async fn test_decrypt_body_wrong_key() {
        let mut key = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut key).unwrap();
        let body = encrypt_body(&key, b"some plaintext");

        let mut wrong = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut wrong).unwrap();
        let mut stream = Box::pin(decrypt_body(Cursor::new(body), material(wrong), None));
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, BodyError::SegmentAuth));
    }

    #[tokio::test]
    async fn test_decrypt_body_empty() {
        let mut key = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut key).unwrap();
        let out = collect(decrypt_body(Cursor::new(Vec::new()), material(key), None)).await;
        assert!(out.is_empty());
    }
}
