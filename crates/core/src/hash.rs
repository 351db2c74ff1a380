use sha2::{Digest, Sha256};

/// Hex SHA-256 of the uncompressed dump text.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(content);
    hasher.finish()
}

/// Incremental form of [`content_hash`], fed while a dump is streamed to disk.
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}
