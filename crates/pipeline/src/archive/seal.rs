//! Password sealing for archive streams.
//!
//! The stream is cut into fixed-size chunks, each encrypted with AES-GCM.
//! The key is derived from the password with Argon2id over a fixed salt
//! chosen by key length, and each chunk's nonce is an HMAC of its
//! position and plaintext. Sealing the same bytes with the same password
//! therefore always yields the same output.
//!
//! Layout: `MAGIC | key_len:u8 | frame*` where a frame is
//! `ct_len:u32be | nonce[12] | ciphertext`. The associated data of each frame
//! binds its index and whether it is the final frame, so reordering and
//! truncation are detected.

use std::io::{self, Read, Write};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use argon2::Argon2;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const MAGIC: &[u8; 8] = b"STWSEAL1";

const CHUNK_SIZE: usize = 64 * 1024;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const SALT_128: &[u8; 8] = b"stw.k128";
const SALT_256: &[u8; 16] = b"stowage.key.256\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStrength {
    Aes128,
    #[default]
    Aes256,
}

impl KeyStrength {
    pub fn key_len(&self) -> usize {
        match self {
            KeyStrength::Aes128 => 16,
            KeyStrength::Aes256 => 32,
        }
    }

    fn salt(&self) -> &'static [u8] {
        match self {
            KeyStrength::Aes128 => SALT_128,
            KeyStrength::Aes256 => SALT_256,
        }
    }

    fn from_key_len(len: u8) -> Option<Self> {
        match len {
            16 => Some(KeyStrength::Aes128),
            32 => Some(KeyStrength::Aes256),
            _ => None,
        }
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn mac(key: &[u8]) -> io::Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| invalid(e.to_string()))
}

/// Argon2id key for `password` over the strength's fixed salt.
fn derive_key(password: &str, strength: KeyStrength) -> io::Result<Vec<u8>> {
    let mut key = vec![0u8; strength.key_len()];
    Argon2::default()
        .hash_password_into(password.as_bytes(), strength.salt(), &mut key)
        .map_err(|e| invalid(format!("key derivation failed: {e}")))?;
    Ok(key)
}

enum Cipher {
    A128(Box<Aes128Gcm>),
    A256(Box<Aes256Gcm>),
}

struct Sealer {
    cipher: Cipher,
    key: Vec<u8>,
}

impl Sealer {
    fn new(password: &str, strength: KeyStrength) -> io::Result<Self> {
        let key = derive_key(password, strength)?;
        let cipher = match strength {
            KeyStrength::Aes128 => Cipher::A128(Box::new(
                Aes128Gcm::new_from_slice(&key).map_err(|e| invalid(e.to_string()))?,
            )),
            KeyStrength::Aes256 => Cipher::A256(Box::new(
                Aes256Gcm::new_from_slice(&key).map_err(|e| invalid(e.to_string()))?,
            )),
        };
        Ok(Self { cipher, key })
    }

    fn aad(index: u64, last: bool) -> [u8; 9] {
        let mut aad = [0u8; 9];
        aad[..8].copy_from_slice(&index.to_be_bytes());
        aad[8] = u8::from(last);
        aad
    }

    fn nonce(&self, aad: &[u8], plaintext: &[u8]) -> io::Result<[u8; NONCE_LEN]> {
        let mut m = mac(&self.key)?;
        m.update(aad);
        m.update(plaintext);
        let digest = m.finalize().into_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        Ok(nonce)
    }

    fn encrypt(&self, nonce: &[u8; NONCE_LEN], aad: &[u8], msg: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload { msg, aad };
        match &self.cipher {
            Cipher::A128(c) => c.encrypt(nonce, payload),
            Cipher::A256(c) => c.encrypt(nonce, payload),
        }
        .map_err(|_| invalid("chunk encryption failed"))
    }

    fn decrypt(&self, nonce: &[u8], aad: &[u8], msg: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload { msg, aad };
        match &self.cipher {
            Cipher::A128(c) => c.decrypt(nonce, payload),
            Cipher::A256(c) => c.decrypt(nonce, payload),
        }
        .map_err(|_| invalid("wrong password or corrupted archive"))
    }
}

// ---------------------------------------------------------------------------
// SealWriter
// ---------------------------------------------------------------------------

pub struct SealWriter<W: Write> {
    inner: W,
    sealer: Sealer,
    buf: Vec<u8>,
    index: u64,
}

impl<W: Write> SealWriter<W> {
    pub fn new(mut inner: W, password: &str, strength: KeyStrength) -> io::Result<Self> {
        let sealer = Sealer::new(password, strength)?;
        inner.write_all(MAGIC)?;
        inner.write_all(&[strength.key_len() as u8])?;
        Ok(Self {
            inner,
            sealer,
            buf: Vec::with_capacity(CHUNK_SIZE),
            index: 0,
        })
    }

    fn write_frame(&mut self, last: bool) -> io::Result<()> {
        let aad = Sealer::aad(self.index, last);
        let nonce = self.sealer.nonce(&aad, &self.buf)?;
        let ct = self.sealer.encrypt(&nonce, &aad, &self.buf)?;
        let len = u32::try_from(ct.len()).map_err(|_| invalid("frame too large"))?;
        self.inner.write_all(&len.to_be_bytes())?;
        self.inner.write_all(&nonce)?;
        self.inner.write_all(&ct)?;
        self.buf.clear();
        self.index += 1;
        Ok(())
    }

    /// Emit the final frame and return the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_frame(true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for SealWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = CHUNK_SIZE - self.buf.len();
        let take = room.min(data.len());
        self.buf.extend_from_slice(&data[..take]);
        if self.buf.len() == CHUNK_SIZE {
            self.write_frame(false)?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ---------------------------------------------------------------------------
// SealReader
// ---------------------------------------------------------------------------

pub struct SealReader<R: Read> {
    inner: R,
    sealer: Sealer,
    plain: Vec<u8>,
    pos: usize,
    index: u64,
    done: bool,
}

impl<R: Read> SealReader<R> {
    /// `inner` must be positioned just after [`MAGIC`].
    pub fn new(mut inner: R, password: &str) -> io::Result<Self> {
        let mut key_len = [0u8; 1];
        inner.read_exact(&mut key_len)?;
        let strength = KeyStrength::from_key_len(key_len[0])
            .ok_or_else(|| invalid(format!("unsupported key length {}", key_len[0])))?;
        Ok(Self {
            inner,
            sealer: Sealer::new(password, strength)?,
            plain: Vec::new(),
            pos: 0,
            index: 0,
            done: false,
        })
    }

    fn next_frame(&mut self) -> io::Result<()> {
        let mut len = [0u8; 4];
        self.inner
            .read_exact(&mut len)
            .map_err(|_| invalid("sealed archive is truncated"))?;
        let len = u32::from_be_bytes(len) as usize;
        if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
            return Err(invalid(format!("bad frame length {len}")));
        }
        let mut nonce = [0u8; NONCE_LEN];
        self.inner.read_exact(&mut nonce)?;
        let mut ct = vec![0u8; len];
        self.inner.read_exact(&mut ct)?;

        // The final flag is not stored; try "more frames follow" first.
        let plain = match self
            .sealer
            .decrypt(&nonce, &Sealer::aad(self.index, false), &ct)
        {
            Ok(p) => p,
            Err(_) => {
                let p = self
                    .sealer
                    .decrypt(&nonce, &Sealer::aad(self.index, true), &ct)?;
                self.done = true;
                p
            }
        };
        self.plain = plain;
        self.pos = 0;
        self.index += 1;
        Ok(())
    }
}

impl<R: Read> Read for SealReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.done {
                return Ok(0);
            }
            self.next_frame()?;
        }
        let n = out.len().min(self.plain.len() - self.pos);
        out[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
