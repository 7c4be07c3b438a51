use serde::{Deserialize, Serialize};

pub const OP_FALSE: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_2DROP: u8 = 0x6d;
pub const OP_DROP: u8 = 0x75;
pub const OP_CHECKSIG: u8 = 0xac;

/// Where the key-lock sits relative to the pushed data fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockPosition {
    Before,
    After,
}

/// A parsed script element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Push(Vec<u8>),
    Op(u8),
}

/// Output locking script, kept as raw bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockingScript(Vec<u8>);

/// Opaque unlocking material produced by the wallet for one input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockTemplate(pub Vec<u8>);

fn write_push(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len <= u8::MAX as usize {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= u16::MAX as usize {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

fn read_len(bytes: &[u8], at: usize, width: usize) -> Option<usize> {
    let raw = bytes.get(at..at + width)?;
    let mut buf = [0u8; 4];
    buf[..width].copy_from_slice(raw);
    Some(u32::from_le_bytes(buf) as usize)
}

impl LockingScript {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Provably unspendable data carrier: `OP_FALSE OP_RETURN <fields...>`
    pub fn op_return(fields: &[Vec<u8>]) -> Self {
        let mut script = vec![OP_FALSE, OP_RETURN];
        for field in fields {
            write_push(&mut script, field);
        }
        Self(script)
    }

    /// Data fields followed (or preceded) by a single-key lock, with the fields dropped at runtime
    pub fn pushdrop(fields: &[Vec<u8>], key: &[u8], position: LockPosition) -> Self {
        let mut lock = Vec::new();
        write_push(&mut lock, key);
        lock.push(OP_CHECKSIG);

        let mut data = Vec::new();
        for field in fields {
            write_push(&mut data, field);
        }
        for _ in 0..fields.len() / 2 {
            data.push(OP_2DROP);
        }
        if fields.len() % 2 == 1 {
            data.push(OP_DROP);
        }

        let script = match position {
            LockPosition::Before => [lock, data].concat(),
            LockPosition::After => [data, lock].concat(),
        };
        Self(script)
    }

    /// Split the script into pushes and opcodes; `None` if a push runs past the end
    pub fn chunks(&self) -> Option<Vec<Chunk>> {
        let bytes = &self.0;
        let mut chunks = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            let op = bytes[i];
            let (len, header) = match op {
                0x01..=0x4b => (op as usize, 1),
                OP_PUSHDATA1 => (read_len(bytes, i + 1, 1)?, 2),
                OP_PUSHDATA2 => (read_len(bytes, i + 1, 2)?, 3),
                OP_PUSHDATA4 => (read_len(bytes, i + 1, 4)?, 5),
                _ => {
                    chunks.push(Chunk::Op(op));
                    i += 1;
                    continue;
                }
            };
            let start = i + header;
            let data = bytes.get(start..start + len)?;
            chunks.push(Chunk::Push(data.to_vec()));
            i = start + len;
        }
        Some(chunks)
    }

    pub fn is_unspendable(&self) -> bool {
        self.0.starts_with(&[OP_FALSE, OP_RETURN])
    }

    /// Fields carried by an `OP_FALSE OP_RETURN` script
    pub fn data_fields(&self) -> Option<Vec<Vec<u8>>> {
        if !self.is_unspendable() {
            return None;
        }
        let chunks = self.chunks()?;
        chunks
            .into_iter()
            .skip(2)
            .map(|chunk| match chunk {
                Chunk::Push(data) => Some(data),
                Chunk::Op(_) => None,
            })
            .collect()
    }

    /// Recover `(fields, key)` from a pushdrop script
    pub fn decode_pushdrop(&self) -> Option<(Vec<Vec<u8>>, Vec<u8>)> {
        let chunks = self.chunks()?;
        let is_drop = |c: &Chunk| matches!(c, Chunk::Op(OP_DROP) | Chunk::Op(OP_2DROP));

        let (key, body) = match chunks.as_slice() {
            [Chunk::Push(key), Chunk::Op(OP_CHECKSIG), rest @ ..] => (key.clone(), rest),
            [rest @ .., Chunk::Push(key), Chunk::Op(OP_CHECKSIG)] => (key.clone(), rest),
            _ => return None,
        };

        let mut fields = Vec::new();
        for chunk in body.iter().filter(|c| !is_drop(c)) {
            match chunk {
                Chunk::Push(data) => fields.push(data.clone()),
                Chunk::Op(_) => return None,
            }
        }
        Some((fields, key))
    }
}
