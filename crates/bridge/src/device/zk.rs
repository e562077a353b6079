// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Vendor TCP driver.
//!
//! Speaks the minimal command subset the bridge needs: connect/exit, realtime
//! registration, attendance log read, user table read/write, and the identity
//! options. Frames are `PP\x82\x7d` + u32 length, then
//! `cmd, checksum, session, reply` (all LE u16) + data. A dedicated reader
//! task owns the socket's read half; realtime frames are forwarded to the
//! registered sink, everything else is routed back to the in-flight command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{DeviceDriver, DeviceInfo, DeviceUser, LogEntry, NewDeviceUser, RawDeviceEvent};

const MAGIC: [u8; 4] = [0x50, 0x50, 0x82, 0x7d];

const CMD_CONNECT: u16 = 1000;
const CMD_EXIT: u16 = 1001;
const CMD_REG_EVENT: u16 = 500;
const CMD_ACK_OK: u16 = 2000;
const CMD_PREPARE_DATA: u16 = 1500;
const CMD_DATA: u16 = 1501;
const CMD_FREE_DATA: u16 = 1502;
const CMD_ATTLOG_RRQ: u16 = 13;
const CMD_USER_WRQ: u16 = 8;
const CMD_USERTEMP_RRQ: u16 = 9;
const CMD_DELETE_USER: u16 = 18;
const CMD_GET_VERSION: u16 = 1100;
const CMD_OPTIONS_RRQ: u16 = 11;

/// Realtime event mask: attendance log entries only.
const EF_ATTLOG: u32 = 1;

/// Attendance log entries are fixed 40-byte records.
const ATTLOG_RECORD: usize = 40;
/// User table entries are fixed 72-byte records.
const USER_RECORD: usize = 72;

/// A parsed vendor frame.
#[derive(Debug)]
struct Packet {
    cmd: u16,
    session: u16,
    data: Vec<u8>,
}

struct Conn {
    writer: OwnedWriteHalf,
    session_id: u16,
    reply_id: u16,
    reply_rx: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
}

pub struct ZkDriver {
    ip: String,
    port: u16,
    connect_timeout: Duration,
    op_timeout: Duration,
    conn: tokio::sync::Mutex<Option<Conn>>,
    connected: Arc<AtomicBool>,
    event_tx: Arc<Mutex<Option<mpsc::Sender<RawDeviceEvent>>>>,
}

impl ZkDriver {
    pub fn new(ip: String, port: u16, connect_timeout: Duration, op_timeout: Duration) -> Self {
        Self {
            ip,
            port,
            connect_timeout,
            op_timeout,
            conn: tokio::sync::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            event_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Send one command and wait for its reply.
    async fn send_command(
        &self,
        conn: &mut Conn,
        cmd: u16,
        data: &[u8],
    ) -> anyhow::Result<Packet> {
        conn.reply_id = conn.reply_id.wrapping_add(1);
        let frame = build_frame(cmd, conn.session_id, conn.reply_id, data);
        conn.writer.write_all(&frame).await?;

        let reply = tokio::time::timeout(self.op_timeout, conn.reply_rx.recv())
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
            .ok_or_else(|| anyhow::anyhow!("device connection closed"))?;
        Ok(reply)
    }

    /// Send a command whose reply may arrive as a bulk transfer
    /// (PREPARE_DATA + DATA frames) or inline.
    async fn read_bulk(&self, conn: &mut Conn, cmd: u16, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let first = self.send_command(conn, cmd, data).await?;
        match first.cmd {
            CMD_DATA | CMD_ACK_OK => Ok(first.data),
            CMD_PREPARE_DATA => {
                let total = first
                    .data
                    .get(0..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
                    .unwrap_or(0);
                let mut buf = Vec::with_capacity(total);
                while buf.len() < total {
                    let chunk = tokio::time::timeout(self.op_timeout, conn.reply_rx.recv())
                        .await
                        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
                        .ok_or_else(|| anyhow::anyhow!("device connection closed"))?;
                    match chunk.cmd {
                        CMD_DATA => buf.extend_from_slice(&chunk.data),
                        CMD_ACK_OK => break,
                        other => anyhow::bail!("unexpected frame {other} during bulk read"),
                    }
                }
                // Release the device-side transfer buffer; failure is harmless.
                conn.reply_id = conn.reply_id.wrapping_add(1);
                let free = build_frame(CMD_FREE_DATA, conn.session_id, conn.reply_id, &[]);
                let _ = conn.writer.write_all(&free).await;
                let _ = tokio::time::timeout(self.op_timeout, conn.reply_rx.recv()).await;
                Ok(buf)
            }
            other => anyhow::bail!("device rejected command {cmd} with {other}"),
        }
    }

    /// Best-effort identity option read (`name=value` wire shape).
    async fn read_option(&self, conn: &mut Conn, name: &str) -> Option<String> {
        let mut data = name.as_bytes().to_vec();
        data.push(0);
        let reply = self.send_command(conn, CMD_OPTIONS_RRQ, &data).await.ok()?;
        let text = cstr(&reply.data);
        text.split_once('=').map(|(_, v)| v.trim().to_owned()).filter(|v| !v.is_empty())
    }
}

#[async_trait]
impl DeviceDriver for ZkDriver {
    async fn connect(&self) -> anyhow::Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.ip.as_str(), self.port)),
        )
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let cancel = CancellationToken::new();
        let (reply_tx, reply_rx) = mpsc::channel(16);
        spawn_reader(
            read_half,
            reply_tx,
            Arc::clone(&self.event_tx),
            Arc::clone(&self.connected),
            cancel.clone(),
        );

        let mut conn =
            Conn { writer: write_half, session_id: 0, reply_id: 0, reply_rx, cancel };

        let reply = self.send_command(&mut conn, CMD_CONNECT, &[]).await?;
        if reply.cmd != CMD_ACK_OK {
            conn.cancel.cancel();
            anyhow::bail!("device refused session: reply {}", reply.cmd);
        }
        conn.session_id = reply.session;

        *guard = Some(conn);
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(ip = %self.ip, port = self.port, "device session established");
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let conn = self.conn.lock().await.take();
        if let Some(mut conn) = conn {
            // Graceful exit, but never hang on a wedged device.
            conn.reply_id = conn.reply_id.wrapping_add(1);
            let frame = build_frame(CMD_EXIT, conn.session_id, conn.reply_id, &[]);
            let _ = tokio::time::timeout(Duration::from_secs(1), conn.writer.write_all(&frame))
                .await;
            conn.cancel.cancel();
        }
        Ok(())
    }

    async fn enable_realtime(&self) -> anyhow::Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| anyhow::anyhow!("device not connected"))?;
        let reply = self.send_command(conn, CMD_REG_EVENT, &EF_ATTLOG.to_le_bytes()).await?;
        if reply.cmd != CMD_ACK_OK {
            anyhow::bail!("realtime registration refused: reply {}", reply.cmd);
        }
        Ok(())
    }

    fn on_event(&self, tx: mpsc::Sender<RawDeviceEvent>) {
        *self.event_tx.lock() = Some(tx);
    }

    async fn pull_log(&self) -> anyhow::Result<Vec<LogEntry>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| anyhow::anyhow!("device not connected"))?;
        let raw = self.read_bulk(conn, CMD_ATTLOG_RRQ, &[]).await?;
        Ok(raw.chunks_exact(ATTLOG_RECORD).filter_map(parse_attlog_record).collect())
    }

    async fn set_user(&self, user: &NewDeviceUser) -> anyhow::Result<()> {
        let record = encode_user_record(user);
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| anyhow::anyhow!("device not connected"))?;
        let reply = self.send_command(conn, CMD_USER_WRQ, &record).await?;
        if reply.cmd != CMD_ACK_OK {
            anyhow::bail!("user write refused: reply {}", reply.cmd);
        }
        Ok(())
    }

    async fn delete_user(&self, biometric_id: &str) -> anyhow::Result<()> {
        let uid: u16 = biometric_id
            .parse()
            .map_err(|_| anyhow::anyhow!("biometric id {biometric_id:?} is not a device uid"))?;
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| anyhow::anyhow!("device not connected"))?;
        let reply = self.send_command(conn, CMD_DELETE_USER, &uid.to_le_bytes()).await?;
        if reply.cmd != CMD_ACK_OK {
            anyhow::bail!("user delete refused: reply {}", reply.cmd);
        }
        Ok(())
    }

    async fn get_users(&self) -> anyhow::Result<Vec<DeviceUser>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| anyhow::anyhow!("device not connected"))?;
        let raw = self.read_bulk(conn, CMD_USERTEMP_RRQ, &[5, 0, 0, 0]).await?;
        Ok(raw.chunks_exact(USER_RECORD).filter_map(parse_user_record).collect())
    }

    async fn get_info(&self) -> anyhow::Result<DeviceInfo> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| anyhow::anyhow!("device not connected"))?;
        let firmware = self
            .send_command(conn, CMD_GET_VERSION, &[])
            .await
            .ok()
            .map(|p| cstr(&p.data))
            .filter(|s| !s.is_empty());
        let serial = self.read_option(conn, "~SerialNumber").await;
        let name = self.read_option(conn, "~DeviceName").await;
        let model = self.read_option(conn, "~Platform").await;
        Ok(DeviceInfo {
            ip: self.ip.clone(),
            port: self.port,
            mac: None,
            name: name.unwrap_or_else(|| "Biometric Device".to_owned()),
            serial,
            model,
            firmware,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// -- Framing ------------------------------------------------------------------

/// 16-bit ones'-complement checksum over the payload with a zeroed checksum
/// field.
fn checksum(payload: &[u8]) -> u16 {
    let mut sum: u64 = 0;
    let mut chunks = payload.chunks_exact(2);
    for c in &mut chunks {
        sum += u16::from_le_bytes([c[0], c[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        sum += *last as u64;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn build_frame(cmd: u16, session: u16, reply: u16, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + data.len());
    payload.extend_from_slice(&cmd.to_le_bytes());
    payload.extend_from_slice(&[0, 0]);
    payload.extend_from_slice(&session.to_le_bytes());
    payload.extend_from_slice(&reply.to_le_bytes());
    payload.extend_from_slice(data);
    let ck = checksum(&payload);
    payload[2] = ck.to_le_bytes()[0];
    payload[3] = ck.to_le_bytes()[1];

    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}

fn parse_payload(payload: &[u8]) -> Option<Packet> {
    let cmd = u16::from_le_bytes([*payload.first()?, *payload.get(1)?]);
    let session = u16::from_le_bytes([*payload.get(4)?, *payload.get(5)?]);
    let data = payload.get(8..).unwrap_or_default().to_vec();
    Some(Packet { cmd, session, data })
}

/// Reader task: parses frames off the socket, forwards realtime events to
/// the registered sink, and hands everything else to the command path.
fn spawn_reader(
    mut read_half: OwnedReadHalf,
    reply_tx: mpsc::Sender<Packet>,
    event_tx: Arc<Mutex<Option<mpsc::Sender<RawDeviceEvent>>>>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let mut header = [0u8; 8];
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                r = read_half.read_exact(&mut header) => r,
            };
            if read.is_err() || header[..4] != MAGIC {
                break;
            }
            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            if len < 8 || len > 1 << 20 {
                break;
            }
            let mut payload = vec![0u8; len];
            if read_half.read_exact(&mut payload).await.is_err() {
                break;
            }
            let Some(packet) = parse_payload(&payload) else { continue };

            if packet.cmd == CMD_REG_EVENT {
                let event = parse_realtime_event(&packet.data);
                let tx = event_tx.lock().clone();
                if let Some(tx) = tx {
                    // The read loop is precious; drop rather than block.
                    let _ = tx.try_send(event);
                }
                continue;
            }
            if reply_tx.send(packet).await.is_err() {
                break;
            }
        }
        // A dead read loop means a dead socket; the session watchdog keys
        // off this flag.
        connected.store(false, Ordering::SeqCst);
        tracing::debug!("device reader loop ended");
    });
}

// -- Record codecs ------------------------------------------------------------

/// NUL-terminated ASCII out of a fixed field.
fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Device timestamps count seconds in a packed mixed-radix scheme anchored
/// at 2000-01-01.
fn decode_time(mut t: u32) -> Option<chrono::DateTime<Utc>> {
    let second = t % 60;
    t /= 60;
    let minute = t % 60;
    t /= 60;
    let hour = t % 24;
    t /= 24;
    let day = t % 31 + 1;
    t /= 31;
    let month = t % 12 + 1;
    t /= 12;
    let year = 2000 + t;
    chrono::NaiveDate::from_ymd_opt(year as i32, month, day)?
        .and_hms_opt(hour, minute, second)
        .map(|dt| dt.and_utc())
}

/// 40-byte attlog record: uid (LE u16), user id (9 bytes, NUL-padded),
/// verify state, packed time at offset 27.
fn parse_attlog_record(rec: &[u8]) -> Option<LogEntry> {
    let uid = u16::from_le_bytes([*rec.first()?, *rec.get(1)?]);
    let user_id = cstr(rec.get(2..11)?);
    let t = u32::from_le_bytes([*rec.get(27)?, *rec.get(28)?, *rec.get(29)?, *rec.get(30)?]);
    let instant = decode_time(t)?.to_rfc3339();
    let biometric_id = if user_id.is_empty() { uid.to_string() } else { user_id };
    Some(LogEntry { biometric_id, instant })
}

/// 72-byte user record: uid (LE u16), role, password (8), name (24),
/// card (LE u32), group, user id (9 bytes at offset 48).
fn parse_user_record(rec: &[u8]) -> Option<DeviceUser> {
    let uid = u16::from_le_bytes([*rec.first()?, *rec.get(1)?]);
    let role = *rec.get(2)?;
    let name = cstr(rec.get(11..35)?);
    let card_no =
        u32::from_le_bytes([*rec.get(35)?, *rec.get(36)?, *rec.get(37)?, *rec.get(38)?]);
    let user_id = cstr(rec.get(48..57)?);
    let biometric_id = if user_id.is_empty() { uid.to_string() } else { user_id };
    Some(DeviceUser { uid, biometric_id, name, role, card_no })
}

fn encode_user_record(user: &NewDeviceUser) -> Vec<u8> {
    let mut rec = vec![0u8; USER_RECORD];
    rec[0..2].copy_from_slice(&user.uid.to_le_bytes());
    rec[2] = user.role;
    write_padded(&mut rec[3..11], user.password.as_bytes());
    write_padded(&mut rec[11..35], user.name.as_bytes());
    rec[35..39].copy_from_slice(&user.card_no.to_le_bytes());
    rec[39] = 1; // default group
    write_padded(&mut rec[48..57], user.biometric_id.as_bytes());
    rec
}

fn write_padded(field: &mut [u8], value: &[u8]) {
    let n = value.len().min(field.len().saturating_sub(1));
    field[..n].copy_from_slice(&value[..n]);
}

/// Realtime attlog frame: user id (9 bytes, NUL-padded), then a packed time
/// at offset 9 when present.
fn parse_realtime_event(data: &[u8]) -> RawDeviceEvent {
    let user_id = data.get(..9).map(cstr).filter(|s| !s.is_empty());
    let instant = data
        .get(9..13)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .and_then(decode_time)
        .map(|dt| dt.to_rfc3339());
    RawDeviceEvent { biometric_id: user_id, instant }
}

#[cfg(test)]
#[path = "zk_tests.rs"]
mod zk_tests;
