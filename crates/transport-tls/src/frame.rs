//! Length-prefixed frames (u32 BE length) carrying bincode messages.

use serde::{de::DeserializeOwned, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::StreamTrait;

/// Sanity cap to prevent memory exhaustion from a hostile length prefix.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub async fn write_frame<T: StreamTrait + ?Sized>(transport: &mut T, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
    }
    transport.write_all(&(data.len() as u32).to_be_bytes()).await?;
    transport.write_all(data).await?;
    transport.flush().await?;
    Ok(())
}

pub async fn read_frame<T: StreamTrait + ?Sized>(transport: &mut T) -> io::Result<Vec<u8>> {
    let mut lenb = [0u8; 4];
    transport.read_exact(&mut lenb).await?;
    let len = u32::from_be_bytes(lenb) as usize;

    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
    }

    let mut buf = vec![0u8; len];
    transport.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn send_msg<T, M>(transport: &mut T, msg: &M) -> Result<(), FrameError>
where
    T: StreamTrait + ?Sized,
    M: Serialize,
{
    let bytes = bincode::serialize(msg)?;
    write_frame(transport, &bytes).await?;
    Ok(())
}

pub async fn recv_msg<T, M>(transport: &mut T) -> Result<M, FrameError>
where
    T: StreamTrait + ?Sized,
    M: DeserializeOwned,
{
    let bytes = read_frame(transport).await?;
    Ok(bincode::deserialize(&bytes)?)
}
