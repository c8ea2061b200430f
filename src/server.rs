use crate::engine::StorageEngine;
use crate::replication::read_frame;
use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

pub const OP_STREAM_PUT: u8 = 0x01;
pub const OP_ACK: u8 = 0x02;
pub const OP_END_STREAM: u8 = 0x03;
pub const OP_ERROR: u8 = 0x04;

/// Streaming ingest front-end: `[len:u32][opcode:u8][body]` frames, one
/// response per request in FIFO order.
pub async fn start_server(engine: Arc<StorageEngine>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", engine.config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("stream server listening on {addr}");

    loop {
        let (socket, peer) = listener.accept().await?;
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(socket, engine).await {
                tracing::debug!(peer = %peer, error = %e, "stream connection ended");
            }
        });
    }
}

async fn serve_connection(mut socket: TcpStream, engine: Arc<StorageEngine>) -> Result<()> {
    let (mut read_half, mut write_half) = socket.split();

    loop {
        let (opcode, body) = match read_frame(&mut read_half).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                let _ = write_half.write_all(&response(OP_ERROR, e.to_string().as_bytes())).await;
                return Ok(());
            }
        };

        match opcode {
            OP_STREAM_PUT => {
                let reply = match decode_stream_put(&body) {
                    Ok((key, value)) => match engine.put(key, value).await {
                        Ok(()) => response(OP_ACK, &[]),
                        Err(e) => response(OP_ERROR, e.to_string().as_bytes()),
                    },
                    Err(message) => response(OP_ERROR, message.as_bytes()),
                };
                write_half.write_all(&reply).await?;
            }
            OP_END_STREAM => {
                write_half.write_all(&response(OP_ACK, &[])).await?;
                return Ok(());
            }
            other => {
                let message = format!("unknown opcode {other:#04x}");
                write_half.write_all(&response(OP_ERROR, message.as_bytes())).await?;
                return Ok(());
            }
        }
    }
}

fn decode_stream_put(body: &[u8]) -> std::result::Result<(Bytes, Bytes), String> {
    let mut cursor = body;
    if cursor.remaining() < 2 {
        return Err("stream put body too short".into());
    }
    let key_len = cursor.get_u16() as usize;
    if cursor.remaining() < key_len + 4 {
        return Err("stream put key truncated".into());
    }
    let key = Bytes::copy_from_slice(&cursor[..key_len]);
    cursor.advance(key_len);
    let value_len = cursor.get_u32() as usize;
    if cursor.remaining() != value_len {
        return Err("stream put value length mismatch".into());
    }
    let value = Bytes::copy_from_slice(&cursor[..value_len]);
    Ok((key, value))
}

fn response(opcode: u8, body: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(5 + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_u8(opcode);
    frame.put_slice(body);
    frame.freeze()
}
