//! MySQL replication protocol client
//!
//! Implements the slice of the client/server protocol a replica needs:
//! - Handshake and authentication (mysql_native_password,
//!   caching_sha2_password with RSA full auth, MariaDB client_ed25519)
//! - COM_QUERY for session setup statements
//! - COM_REGISTER_SLAVE
//! - COM_BINLOG_DUMP and the event stream that follows
//!
//! ## Authentication
//!
//! ### mysql_native_password (MySQL 5.x default)
//! `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`
//!
//! ### caching_sha2_password (MySQL 8.0+ default)
//! Scramble first; when the server has no cached entry it demands full
//! auth, which over plain TCP means fetching the server's RSA public key and
//! sending the nonce-XORed password PKCS#1-v1.5-encrypted.
//!
//! ### client_ed25519 (MariaDB)
//! Keypair derived from SHA-512(password); the client signs the server's
//! nonce and sends the 64-byte signature.

use crate::common::{CdcError, Result, Validator};
use bytes::{BufMut, BytesMut};
use rand::rngs::OsRng;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::io::Read;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// MySQL packet header: 3 bytes length + 1 byte sequence id.
const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload.
const MAX_PACKET_SIZE: usize = 16_777_215;
/// TCP connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read/write timeout for handshake and command packets.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Capability flags exchanged during the handshake.
mod capability {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
    pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;
}

/// Initial greeting from the server.
#[derive(Debug)]
struct HandshakePacket {
    server_version: String,
    connection_id: u32,
    capability_flags: u32,
    auth_plugin_data: Vec<u8>,
    auth_plugin_name: String,
}

impl HandshakePacket {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let mut buf = [0u8; 1];

        let read_u8 = |cursor: &mut std::io::Cursor<&[u8]>, buf: &mut [u8; 1]| -> Result<u8> {
            Read::read_exact(cursor, buf)
                .map_err(|_| CdcError::replication("truncated handshake packet"))?;
            Ok(buf[0])
        };

        let _protocol_version = read_u8(&mut cursor, &mut buf)?;

        let mut server_version = Vec::new();
        loop {
            let b = read_u8(&mut cursor, &mut buf)?;
            if b == 0 {
                break;
            }
            server_version.push(b);
        }
        let server_version = String::from_utf8_lossy(&server_version).to_string();

        let mut buf4 = [0u8; 4];
        Read::read_exact(&mut cursor, &mut buf4)
            .map_err(|_| CdcError::replication("truncated handshake packet"))?;
        let connection_id = u32::from_le_bytes(buf4);

        let mut auth_data_part1 = vec![0u8; 8];
        Read::read_exact(&mut cursor, &mut auth_data_part1)
            .map_err(|_| CdcError::replication("truncated handshake packet"))?;

        read_u8(&mut cursor, &mut buf)?; // filler

        let mut buf2 = [0u8; 2];
        Read::read_exact(&mut cursor, &mut buf2)
            .map_err(|_| CdcError::replication("truncated handshake packet"))?;
        let cap_lower = u16::from_le_bytes(buf2);

        let _character_set = read_u8(&mut cursor, &mut buf)?;

        Read::read_exact(&mut cursor, &mut buf2)
            .map_err(|_| CdcError::replication("truncated handshake packet"))?;
        let _status_flags = u16::from_le_bytes(buf2);

        Read::read_exact(&mut cursor, &mut buf2)
            .map_err(|_| CdcError::replication("truncated handshake packet"))?;
        let cap_upper = u16::from_le_bytes(buf2);
        let capability_flags = ((cap_upper as u32) << 16) | (cap_lower as u32);

        let auth_data_len = read_u8(&mut cursor, &mut buf)? as usize;

        let mut reserved = [0u8; 10];
        Read::read_exact(&mut cursor, &mut reserved)
            .map_err(|_| CdcError::replication("truncated handshake packet"))?;

        let part2_len = if auth_data_len > 8 { auth_data_len - 8 } else { 13 };
        let mut auth_data_part2 = vec![0u8; part2_len];
        Read::read_exact(&mut cursor, &mut auth_data_part2)
            .map_err(|_| CdcError::replication("truncated handshake packet"))?;
        if let Some(pos) = auth_data_part2.iter().position(|&b| b == 0) {
            auth_data_part2.truncate(pos);
        }

        let mut auth_plugin_name = Vec::new();
        if capability_flags & capability::CLIENT_PLUGIN_AUTH != 0 {
            loop {
                let n = Read::read(&mut cursor, &mut buf)
                    .map_err(|_| CdcError::replication("truncated handshake packet"))?;
                if n == 0 || buf[0] == 0 {
                    break;
                }
                auth_plugin_name.push(buf[0]);
            }
        }
        let auth_plugin_name = String::from_utf8_lossy(&auth_plugin_name).to_string();

        let mut auth_plugin_data = auth_data_part1;
        auth_plugin_data.extend_from_slice(&auth_data_part2);

        Ok(Self {
            server_version,
            connection_id,
            capability_flags,
            auth_plugin_data,
            auth_plugin_name,
        })
    }
}

/// Replication protocol client. After [`start_dump`](Self::start_dump) the
/// connection carries a one-way stream of binlog event packets read with
/// [`next_event`](Self::next_event).
pub struct MySqlBinlogClient {
    stream: BufReader<TcpStream>,
    sequence_id: u8,
    server_version: String,
    connection_id: u32,
}

impl std::fmt::Debug for MySqlBinlogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlBinlogClient")
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .field("sequence_id", &self.sequence_id)
            .finish_non_exhaustive()
    }
}

impl MySqlBinlogClient {
    /// Connect and authenticate.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        Validator::validate_identifier(user)?;

        let addr = format!("{host}:{port}");
        info!("Connecting to MySQL at {addr}");

        let tcp = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(CdcError::replication(format!(
                    "failed to connect to {addr}: {e}"
                )))
            }
            Err(_) => {
                return Err(CdcError::replication(format!(
                    "connection to {addr} timed out after {CONNECT_TIMEOUT:?}"
                )))
            }
        };

        let mut client = Self {
            stream: BufReader::new(tcp),
            sequence_id: 0,
            server_version: String::new(),
            connection_id: 0,
        };

        let handshake_data = client.read_packet(COMMAND_TIMEOUT).await?;
        let handshake = HandshakePacket::parse(&handshake_data)?;

        info!(
            "Connected to MySQL {} (connection_id={})",
            handshake.server_version, handshake.connection_id
        );
        debug!("Auth plugin: {}", handshake.auth_plugin_name);

        client.server_version = handshake.server_version.clone();
        client.connection_id = handshake.connection_id;
        client.authenticate(user, password, &handshake).await?;

        Ok(client)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn is_mariadb(&self) -> bool {
        self.server_version.contains("MariaDB")
    }

    async fn read_packet(&mut self, limit: Duration) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        timeout(limit, self.stream.read_exact(&mut header))
            .await
            .map_err(|_| CdcError::timeout(format!("MySQL read timed out after {limit:?}")))?
            .map_err(map_io)?;

        let payload_len =
            (header[0] as usize) | ((header[1] as usize) << 8) | ((header[2] as usize) << 16);
        self.sequence_id = header[3].wrapping_add(1);

        let mut payload = vec![0u8; payload_len];
        timeout(limit, self.stream.read_exact(&mut payload))
            .await
            .map_err(|_| CdcError::timeout(format!("MySQL read timed out after {limit:?}")))?
            .map_err(map_io)?;

        Ok(payload)
    }

    async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len();
        if len > MAX_PACKET_SIZE {
            return Err(CdcError::replication(format!(
                "packet too large: {len} bytes"
            )));
        }

        let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + len);
        packet.push((len & 0xFF) as u8);
        packet.push(((len >> 8) & 0xFF) as u8);
        packet.push(((len >> 16) & 0xFF) as u8);
        packet.push(self.sequence_id);
        packet.extend_from_slice(data);

        timeout(COMMAND_TIMEOUT, async {
            self.stream.get_mut().write_all(&packet).await?;
            self.stream.get_mut().flush().await
        })
        .await
        .map_err(|_| CdcError::timeout(format!("MySQL write timed out after {COMMAND_TIMEOUT:?}")))?
        .map_err(map_io)?;

        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }

    async fn authenticate(
        &mut self,
        user: &str,
        password: Option<&str>,
        handshake: &HandshakePacket,
    ) -> Result<()> {
        let client_flags = capability::CLIENT_PROTOCOL_41
            | capability::CLIENT_SECURE_CONNECTION
            | capability::CLIENT_LONG_PASSWORD
            | capability::CLIENT_TRANSACTIONS
            | capability::CLIENT_PLUGIN_AUTH
            | capability::CLIENT_DEPRECATE_EOF;

        let auth_response = match handshake.auth_plugin_name.as_str() {
            "mysql_native_password" => {
                mysql_native_password(password, &handshake.auth_plugin_data)
            }
            "caching_sha2_password" => {
                caching_sha2_password(password, &handshake.auth_plugin_data)
            }
            "client_ed25519" => client_ed25519(password, &handshake.auth_plugin_data),
            other => {
                warn!("Unknown auth plugin {other}, trying mysql_native_password");
                mysql_native_password(password, &handshake.auth_plugin_data)
            }
        };

        let mut response = BytesMut::with_capacity(256);
        response.put_u32_le(client_flags);
        response.put_u32_le(MAX_PACKET_SIZE as u32);
        response.put_u8(45); // utf8mb4
        response.put_slice(&[0u8; 23]);
        response.put_slice(user.as_bytes());
        response.put_u8(0);
        response.put_u8(auth_response.len() as u8);
        response.put_slice(&auth_response);
        response.put_slice(handshake.auth_plugin_name.as_bytes());
        response.put_u8(0);

        self.write_packet(&response).await?;

        let resp = self.read_packet(COMMAND_TIMEOUT).await?;
        let plugin = handshake.auth_plugin_name.as_str();

        match resp.first() {
            Some(0x00) => {
                debug!("Authentication successful");
                Ok(())
            }
            Some(0x01)
                if plugin == "caching_sha2_password" || plugin == "sha256_password" =>
            {
                self.handle_caching_sha2_response(&resp, &handshake.auth_plugin_data, password)
                    .await
            }
            Some(0xFF) => Err(server_error("authentication failed", &resp)),
            Some(0xFE) => {
                // auth switch request
                let name_end = resp[1..].iter().position(|&b| b == 0).unwrap_or(resp.len() - 1);
                let switch_plugin = String::from_utf8_lossy(&resp[1..1 + name_end]).to_string();
                let auth_data = resp.get(2 + name_end..).unwrap_or_default().to_vec();
                debug!("Auth switch to plugin: {switch_plugin}");
                self.handle_auth_switch(&switch_plugin, &auth_data, password)
                    .await
            }
            Some(other) => Err(CdcError::replication(format!(
                "unexpected auth response: 0x{other:02X}"
            ))),
            None => Err(CdcError::replication("empty auth response")),
        }
    }

    async fn handle_auth_switch(
        &mut self,
        plugin: &str,
        auth_data: &[u8],
        password: Option<&str>,
    ) -> Result<()> {
        let auth_response = match plugin {
            "mysql_native_password" => mysql_native_password(password, auth_data),
            "caching_sha2_password" | "sha256_password" => {
                caching_sha2_password(password, auth_data)
            }
            "client_ed25519" => client_ed25519(password, auth_data),
            other => {
                return Err(CdcError::replication(format!(
                    "unsupported auth plugin for switch: {other}"
                )))
            }
        };

        self.write_packet(&auth_response).await?;

        let resp = self.read_packet(COMMAND_TIMEOUT).await?;
        match resp.first() {
            Some(0x00) => Ok(()),
            Some(0x01) if plugin == "caching_sha2_password" || plugin == "sha256_password" => {
                self.handle_caching_sha2_response(&resp, auth_data, password)
                    .await
            }
            Some(0xFF) => Err(server_error("auth switch failed", &resp)),
            _ => Err(CdcError::replication("unexpected auth switch response")),
        }
    }

    /// caching_sha2_password continuation: 0x03 = cached fast path done,
    /// 0x04 = server wants the full password (RSA-encrypted on plain TCP).
    async fn handle_caching_sha2_response(
        &mut self,
        resp: &[u8],
        nonce: &[u8],
        password: Option<&str>,
    ) -> Result<()> {
        if resp.len() < 2 {
            return Err(CdcError::replication(
                "invalid caching_sha2_password response: too short",
            ));
        }

        match resp[1] {
            0x03 => {
                debug!("caching_sha2_password: fast auth succeeded");
                Ok(())
            }
            0x04 => {
                debug!("caching_sha2_password: full authentication required");
                self.caching_sha2_full_auth(nonce, password).await
            }
            other => Err(CdcError::replication(format!(
                "unknown caching_sha2_password response type: 0x{other:02X}"
            ))),
        }
    }

    async fn caching_sha2_full_auth(
        &mut self,
        nonce: &[u8],
        password: Option<&str>,
    ) -> Result<()> {
        let pwd = password.unwrap_or("");

        // request the server's RSA public key
        self.write_packet(&[0x02]).await?;

        let pk_resp = self.read_packet(COMMAND_TIMEOUT).await?;
        match pk_resp.first() {
            Some(0x01) => {
                let pem = String::from_utf8_lossy(&pk_resp[1..]);
                debug!("Received server RSA public key");
                let encrypted = rsa_encrypt_password(pwd, nonce, &pem)?;
                self.write_packet(&encrypted).await?;
            }
            Some(0xFF) => return Err(server_error("failed to get public key", &pk_resp)),
            _ => {
                return Err(CdcError::replication(
                    "unexpected public key response",
                ))
            }
        }

        let final_resp = self.read_packet(COMMAND_TIMEOUT).await?;
        match final_resp.first() {
            Some(0x00) => {
                debug!("caching_sha2_password: full authentication succeeded");
                Ok(())
            }
            Some(0xFF) => Err(server_error(
                "caching_sha2_password full auth failed",
                &final_resp,
            )),
            _ => Err(CdcError::replication(
                "unexpected caching_sha2_password final response",
            )),
        }
    }

    /// Execute a statement, discarding any result set.
    pub async fn query(&mut self, sql: &str) -> Result<()> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(0x03); // COM_QUERY
        packet.put_slice(sql.as_bytes());
        self.write_packet(&packet).await?;

        let resp = self.read_packet(COMMAND_TIMEOUT).await?;
        match resp.first() {
            Some(0xFF) => Err(server_error("query failed", &resp)),
            _ => Ok(()),
        }
    }

    /// COM_REGISTER_SLAVE with the configured replica id.
    pub async fn register_replica(&mut self, server_id: u32) -> Result<()> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(0x15); // COM_REGISTER_SLAVE
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname length
        packet.put_u8(0); // user length
        packet.put_u8(0); // password length
        packet.put_u16_le(0); // port
        packet.put_u32_le(0); // replication rank
        packet.put_u32_le(0); // master id

        self.write_packet(&packet).await?;

        let resp = self.read_packet(COMMAND_TIMEOUT).await?;
        match resp.first() {
            Some(0x00) => {
                info!("Registered as replica with server_id={server_id}");
                Ok(())
            }
            Some(0xFF) => Err(server_error("failed to register as replica", &resp)),
            _ => Err(CdcError::replication(
                "unexpected response to COM_REGISTER_SLAVE",
            )),
        }
    }

    /// COM_BINLOG_DUMP from a file+offset position. The connection then
    /// yields event packets via [`next_event`](Self::next_event).
    pub async fn start_dump(&mut self, server_id: u32, file: &str, offset: u32) -> Result<()> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(file.len() + 11);
        packet.put_u8(0x12); // COM_BINLOG_DUMP
        packet.put_u32_le(offset);
        packet.put_u16_le(0); // flags
        packet.put_u32_le(server_id);
        packet.put_slice(file.as_bytes());

        self.write_packet(&packet).await?;
        info!("Started binlog dump from {file}:{offset}");
        Ok(())
    }

    /// Read the next binlog event packet. `Ok(None)` on server EOF;
    /// `CdcError::Timeout` when nothing arrived within `limit`.
    pub async fn next_event(&mut self, limit: Duration) -> Result<Option<bytes::Bytes>> {
        let packet = self.read_packet(limit).await?;
        if packet.is_empty() {
            return Ok(None);
        }

        match packet[0] {
            0x00 => Ok(Some(bytes::Bytes::from(packet[1..].to_vec()))),
            0xFE => {
                debug!("Received EOF in binlog stream");
                Ok(None)
            }
            0xFF => Err(server_error("binlog stream error", &packet)),
            _ => Ok(Some(bytes::Bytes::from(packet))),
        }
    }
}

fn map_io(e: std::io::Error) -> CdcError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CdcError::ConnectionClosed
    } else {
        CdcError::Io(e)
    }
}

/// Decode a server error packet into a replication error.
fn server_error(context: &str, packet: &[u8]) -> CdcError {
    if packet.len() > 9 {
        let code = u16::from_le_bytes([packet[1], packet[2]]);
        let msg = String::from_utf8_lossy(&packet[9..]);
        CdcError::replication(format!("{context}: {code} - {msg}"))
    } else {
        CdcError::replication(context.to_string())
    }
}

// ---------------------------------------------------------------------------
// auth primitives

/// `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`
fn mysql_native_password(password: Option<&str>, salt: &[u8]) -> Vec<u8> {
    match password {
        None | Some("") => vec![],
        Some(pwd) => {
            let mut hasher = Sha1::new();
            hasher.update(pwd.as_bytes());
            let stage1 = hasher.finalize();

            let mut hasher = Sha1::new();
            hasher.update(stage1);
            let stage2 = hasher.finalize();

            let mut hasher = Sha1::new();
            hasher.update(salt);
            hasher.update(stage2);
            let stage3 = hasher.finalize();

            stage1
                .iter()
                .zip(stage3.iter())
                .map(|(a, b)| a ^ b)
                .collect()
        }
    }
}

/// `XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + salt))`
fn caching_sha2_password(password: Option<&str>, salt: &[u8]) -> Vec<u8> {
    match password {
        None | Some("") => vec![],
        Some(pwd) => {
            let mut hasher = Sha256::new();
            hasher.update(pwd.as_bytes());
            let hash1 = hasher.finalize();

            let mut hasher = Sha256::new();
            hasher.update(hash1);
            let hash2 = hasher.finalize();

            let mut hasher = Sha256::new();
            hasher.update(hash2);
            hasher.update(salt);
            let hash3 = hasher.finalize();

            hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
        }
    }
}

/// MariaDB ed25519: sign the server nonce with a key derived from
/// SHA-512(password).
fn client_ed25519(password: Option<&str>, nonce: &[u8]) -> Vec<u8> {
    match password {
        None | Some("") => vec![],
        Some(pwd) => {
            use ed25519_dalek::{Signer, SigningKey};
            use sha2::Sha512;

            let mut hasher = Sha512::new();
            hasher.update(pwd.as_bytes());
            let hash = hasher.finalize();

            let seed: [u8; 32] = match hash[..32].try_into() {
                Ok(seed) => seed,
                Err(_) => return vec![],
            };

            let signing_key = SigningKey::from_bytes(&seed);
            signing_key.sign(nonce).to_bytes().to_vec()
        }
    }
}

/// Encrypt the nonce-XORed password with the server's RSA public key
/// (PKCS#1 v1.5, the scheme MySQL expects).
fn rsa_encrypt_password(password: &str, nonce: &[u8], pem: &str) -> Result<Vec<u8>> {
    let der = parse_pem_public_key(pem)?;

    let mut pwd_bytes = password.as_bytes().to_vec();
    pwd_bytes.push(0);
    for (i, byte) in pwd_bytes.iter_mut().enumerate() {
        *byte ^= nonce[i % nonce.len()];
    }

    let (n, e) = parse_rsa_public_key_der(&der)?;
    let public_key = RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
        .map_err(|e| CdcError::replication(format!("invalid RSA public key: {e}")))?;

    let mut rng = OsRng;
    public_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, &pwd_bytes)
        .map_err(|e| CdcError::replication(format!("RSA encryption failed: {e}")))
}

fn parse_pem_public_key(pem: &str) -> Result<Vec<u8>> {
    const BEGIN: &str = "-----BEGIN PUBLIC KEY-----";
    const END: &str = "-----END PUBLIC KEY-----";

    let pem = pem.trim();
    let start = pem
        .find(BEGIN)
        .ok_or_else(|| CdcError::replication("invalid PEM: missing BEGIN marker"))?
        + BEGIN.len();
    let end = pem
        .find(END)
        .ok_or_else(|| CdcError::replication("invalid PEM: missing END marker"))?;

    let content: String = pem[start..end].chars().filter(|c| !c.is_whitespace()).collect();

    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(&content)
        .map_err(|e| CdcError::replication(format!("failed to decode public key: {e}")))
}

/// Extract (modulus, exponent) from a DER SubjectPublicKeyInfo.
fn parse_rsa_public_key_der(der: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let invalid = |what: &str| CdcError::replication(format!("invalid DER: {what}"));

    let mut pos = 0;
    let expect = |der: &[u8], pos: usize, tag: u8, what: &'static str| -> Result<()> {
        if der.get(pos).copied() != Some(tag) {
            return Err(invalid(what));
        }
        Ok(())
    };

    // outer SEQUENCE
    expect(der, pos, 0x30, "expected SEQUENCE")?;
    pos += 1;
    let (_, len_bytes) = parse_der_length(&der[pos..])?;
    pos += len_bytes;

    // algorithm SEQUENCE (skipped)
    expect(der, pos, 0x30, "expected algorithm SEQUENCE")?;
    pos += 1;
    let (algo_len, len_bytes) = parse_der_length(&der[pos..])?;
    pos += len_bytes + algo_len;

    // BIT STRING wrapping RSAPublicKey
    expect(der, pos, 0x03, "expected BIT STRING")?;
    pos += 1;
    let (_, len_bytes) = parse_der_length(&der[pos..])?;
    pos += len_bytes + 1; // + unused-bits byte

    expect(der, pos, 0x30, "expected RSAPublicKey SEQUENCE")?;
    pos += 1;
    let (_, len_bytes) = parse_der_length(&der[pos..])?;
    pos += len_bytes;

    expect(der, pos, 0x02, "expected modulus INTEGER")?;
    pos += 1;
    let (n_len, len_bytes) = parse_der_length(&der[pos..])?;
    pos += len_bytes;
    if der.len() < pos + n_len {
        return Err(invalid("truncated modulus"));
    }
    let mut n = der[pos..pos + n_len].to_vec();
    if n.first() == Some(&0x00) {
        n.remove(0);
    }
    pos += n_len;

    expect(der, pos, 0x02, "expected exponent INTEGER")?;
    pos += 1;
    let (e_len, len_bytes) = parse_der_length(&der[pos..])?;
    pos += len_bytes;
    if der.len() < pos + e_len {
        return Err(invalid("truncated exponent"));
    }
    let mut e = der[pos..pos + e_len].to_vec();
    if e.first() == Some(&0x00) {
        e.remove(0);
    }

    Ok((n, e))
}

fn parse_der_length(data: &[u8]) -> Result<(usize, usize)> {
    match data.first() {
        None => Err(CdcError::replication("invalid DER: empty length")),
        Some(&b) if b < 0x80 => Ok((b as usize, 1)),
        Some(0x81) => match data.get(1) {
            Some(&b) => Ok((b as usize, 2)),
            None => Err(CdcError::replication("invalid DER: truncated length")),
        },
        Some(0x82) => {
            if data.len() < 3 {
                return Err(CdcError::replication("invalid DER: truncated length"));
            }
            Ok((((data[1] as usize) << 8) | (data[2] as usize), 3))
        }
        Some(&other) => Err(CdcError::replication(format!(
            "invalid DER: unsupported length encoding: 0x{other:02X}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mysql_native_password() {
        let salt = b"12345678901234567890";
        let result = mysql_native_password(Some("password"), salt);
        assert_eq!(result.len(), 20);

        assert!(mysql_native_password(None, salt).is_empty());
        assert!(mysql_native_password(Some(""), salt).is_empty());
    }

    #[test]
    fn test_caching_sha2_password() {
        let salt = b"12345678901234567890";
        let result = caching_sha2_password(Some("password"), salt);
        assert_eq!(result.len(), 32);

        assert!(caching_sha2_password(None, salt).is_empty());
    }

    #[test]
    fn test_caching_sha2_password_consistency() {
        let salt = b"random_salt_12345678";
        let a = caching_sha2_password(Some("secret"), salt);
        let b = caching_sha2_password(Some("secret"), salt);
        assert_eq!(a, b);

        let c = caching_sha2_password(Some("different"), salt);
        assert_ne!(a, c);

        let d = caching_sha2_password(Some("secret"), b"different_salt_12345");
        assert_ne!(a, d);
    }

    #[test]
    fn test_client_ed25519() {
        let nonce = b"12345678901234567890123456789012";
        let sig = client_ed25519(Some("password"), nonce);
        assert_eq!(sig.len(), 64);

        assert!(client_ed25519(None, nonce).is_empty());

        // deterministic per (password, nonce)
        assert_eq!(sig, client_ed25519(Some("password"), nonce));
        assert_ne!(sig, client_ed25519(Some("other"), nonce));
    }

    #[test]
    fn test_parse_pem_public_key() {
        let pem = r#"-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAu1SU1LfVLPHCozMxH2Mo
4lgOEePzNm0tRgeLezV6ffAt0gunVTLw7onLRnrq0/IzW7yWR7QkrmBL7jTKEn5u
+qKhbwKfBstIs+bMY2Zkp18gnTxKLxoS2tFczGkPLPgizskuemMghRniWaoLcyeh
kd3qqGElvW/VDL5AaWTg0nLVkjRo9z+40RQzuVaE8AkAFmxZzow3x+VJYKdjykkJ
0iT9wCS0DRTXu269V264Vf/3jvredZiKRkgwlL9xNAwxXFg0x/XFw005UWVRIkdg
cKWTjpBP2dPwVZ4WWC+9aGVd+Gyn1o0CLelf4rEjGoXbAAEgAqeGUxrcIlbjXfbc
mwIDAQAB
-----END PUBLIC KEY-----"#;

        let der = parse_pem_public_key(pem).unwrap();
        assert!(der.len() > 200);

        let (n, e) = parse_rsa_public_key_der(&der).unwrap();
        assert_eq!(n.len(), 256); // 2048-bit modulus
        assert!(!e.is_empty());
    }

    #[test]
    fn test_parse_pem_invalid() {
        assert!(parse_pem_public_key("not a pem").is_err());
        assert!(parse_pem_public_key("-----BEGIN PUBLIC KEY-----\nMIIBIjAN").is_err());
    }

    #[test]
    fn test_parse_der_length() {
        assert_eq!(parse_der_length(&[50]).unwrap(), (50, 1));
        assert_eq!(parse_der_length(&[0x81, 200]).unwrap(), (200, 2));
        assert_eq!(parse_der_length(&[0x82, 0x01, 0x00]).unwrap(), (256, 3));
        assert!(parse_der_length(&[]).is_err());
        assert!(parse_der_length(&[0x84, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_server_error_format() {
        let mut packet = vec![0xFF, 0x15, 0x04]; // code 1045
        packet.extend_from_slice(b"#28000"); // sql state marker + state
        packet.extend_from_slice(b"Access denied");

        let err = server_error("authentication failed", &packet);
        let msg = err.to_string();
        assert!(msg.contains("authentication failed"));
        assert!(msg.contains("1045"));
        assert!(msg.contains("Access denied"));
    }
}
