use std::{io, mem::take, net::IpAddr, sync::Arc};

use groupie_utils::{strip_angle_brackets, IncomingMessage, Outcome, Pipeline};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Longest accepted command line, CRLF included.
pub const MAX_COMMAND_LINE: usize = 4096;

/// Body of a DATA command, as read from the client.
#[derive(Debug, PartialEq, Eq)]
pub enum Data {
    /// Dot-unstuffed message bytes.
    Message(Vec<u8>),
    /// The message went over the size limit and was discarded.
    TooLarge,
}

/// Represents a single LMTP session, created for each incoming connection.
///
/// Holds the state of the current mail transaction: the LHLO domain,
/// the envelope sender and the recipients accepted so far, in order.
pub struct LmtpSession {
    pipeline: Arc<Pipeline>,
    hostname: String,
    max_message_size: usize,
    client_ip: Option<IpAddr>,
    helo_domain: Option<String>,
    from: Option<String>,
    rcpts: Vec<String>,
}

impl LmtpSession {
    pub fn new(pipeline: Arc<Pipeline>, hostname: &str, max_message_size: usize) -> Self {
        Self {
            pipeline,
            hostname: hostname.to_string(),
            max_message_size,
            client_ip: None,
            helo_domain: None,
            from: None,
            rcpts: Vec::new(),
        }
    }

    pub fn with_client_ip(mut self, client_ip: IpAddr) -> Self {
        self.client_ip = Some(client_ip);
        self
    }

    /// Runs the session until the client quits or closes the connection.
    pub async fn handle<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> io::Result<()> {
        let greeting = format!("{} Groupie LMTP", self.hostname);
        self.write_response(writer, 220, &greeting).await?;

        let mut buffer = Vec::with_capacity(1024);
        loop {
            buffer.clear();
            let (read, truncated) =
                read_line_bounded(reader, &mut buffer, MAX_COMMAND_LINE).await?;
            if read == 0 {
                debug!(client_ip = ?self.client_ip, "Connection closed by client");
                break;
            }
            if truncated {
                warn!(client_ip = ?self.client_ip, length = read, "Command line too long");
                self.write_response(writer, 500, "5.5.2 Line too long").await?;
                continue;
            }
            let line = String::from_utf8_lossy(&buffer);
            debug!("<< {}", line.trim_end());

            let (command, arg) = split_command(&line);
            match command.as_str() {
                "LHLO" => self.handle_lhlo(writer, arg).await?,
                "HELO" | "EHLO" => {
                    self.write_response(writer, 500, "5.5.1 This is LMTP, use LHLO")
                        .await?
                }
                "MAIL" => self.handle_mail(writer, arg).await?,
                "RCPT" => self.handle_rcpt(writer, arg).await?,
                "DATA" => self.handle_data(reader, writer).await?,
                "RSET" => {
                    self.reset();
                    self.write_response(writer, 250, "2.0.0 OK").await?;
                }
                "NOOP" => self.write_response(writer, 250, "2.0.0 OK").await?,
                "QUIT" => {
                    self.write_response(writer, 221, "2.0.0 Bye").await?;
                    break;
                }
                _ => {
                    self.write_response(writer, 502, "5.5.2 Command not implemented")
                        .await?
                }
            }
        }
        writer.flush().await
    }

    fn reset(&mut self) {
        self.from = None;
        self.rcpts.clear();
    }

    async fn handle_lhlo<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        arg: &str,
    ) -> io::Result<()> {
        if arg.is_empty() {
            return self
                .write_response(writer, 501, "5.5.4 LHLO requires a domain")
                .await;
        }
        self.helo_domain = Some(arg.to_string());
        self.reset();
        let size = format!("SIZE {}", self.max_message_size);
        self.write_multiple(
            writer,
            250,
            &[
                self.hostname.as_str(),
                "PIPELINING",
                "ENHANCEDSTATUSCODES",
                size.as_str(),
            ],
        )
        .await
    }

    async fn handle_mail<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        arg: &str,
    ) -> io::Result<()> {
        if self.helo_domain.is_none() {
            return self
                .write_response(writer, 503, "5.5.1 Send LHLO first")
                .await;
        }
        if self.from.is_some() {
            return self
                .write_response(writer, 503, "5.5.1 Nested MAIL command")
                .await;
        }
        match parse_path(arg, "FROM:") {
            Some(from) => {
                self.from = Some(from);
                self.write_response(writer, 250, "2.1.0 OK").await
            }
            None => {
                self.write_response(writer, 501, "5.5.4 Syntax error in parameters or arguments")
                    .await
            }
        }
    }

    async fn handle_rcpt<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        arg: &str,
    ) -> io::Result<()> {
        if self.from.is_none() {
            return self
                .write_response(writer, 503, "5.5.1 Need MAIL command")
                .await;
        }
        let Some(rcpt) = parse_path(arg, "TO:") else {
            return self
                .write_response(writer, 501, "5.5.4 Syntax error in parameters or arguments")
                .await;
        };

        // unknown commands are turned away before any data is read
        match self.pipeline.parser().parse(&rcpt) {
            Ok(command) => {
                debug!(rcpt = %rcpt, command = %command, "Recipient accepted");
                self.rcpts.push(rcpt);
                self.write_response(writer, 250, "2.1.5 OK").await
            }
            Err(e) => {
                warn!(rcpt = %rcpt, error = %e, "Recipient rejected");
                self.write_response(writer, 550, &format!("5.1.1 {e}")).await
            }
        }
    }

    async fn handle_data<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> io::Result<()> {
        if self.rcpts.is_empty() {
            return self
                .write_response(writer, 503, "5.5.1 No valid recipients")
                .await;
        }

        self.write_response(writer, 354, "End data with <CR><LF>.<CR><LF>")
            .await?;

        let Some(data) = read_data(reader, self.max_message_size).await? else {
            debug!("Connection closed during DATA");
            self.reset();
            return Ok(());
        };

        let from = self.from.take().unwrap_or_default();
        let rcpts = take(&mut self.rcpts);

        let raw = match data {
            Data::Message(raw) => raw,
            Data::TooLarge => {
                warn!(
                    from = %from,
                    limit = self.max_message_size,
                    "Message exceeds size limit"
                );
                for _ in &rcpts {
                    self.write_response(writer, 552, "5.3.4 Message too big")
                        .await?;
                }
                return Ok(());
            }
        };

        let mut message = IncomingMessage::new(from, rcpts, raw);
        message.client_ip = self.client_ip;
        message.helo_domain = self.helo_domain.clone();
        info!(
            message_id = %message.id,
            from = %message.from,
            rcpts = message.rcpts.len(),
            size = message.size(),
            "Message received"
        );

        for result in self.pipeline.deliver(&message).await {
            match result.outcome {
                Outcome::Accepted => {
                    let reply = format!("2.0.0 <{}> command accepted", result.recipient);
                    self.write_response(writer, 250, &reply).await?;
                }
                Outcome::Rejected(rejection) => {
                    let reply = format!("{} {}", rejection.status, rejection.reason);
                    self.write_response(writer, rejection.code, &reply).await?;
                }
            }
        }
        Ok(())
    }

    async fn write_inner<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
        separator: &str,
    ) -> io::Result<()> {
        debug!(">> {code}{separator}{message}");
        writer
            .write_all(format!("{code}{separator}{message}\r\n").as_bytes())
            .await
    }

    async fn write_response<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        message: &str,
    ) -> io::Result<()> {
        self.write_inner(writer, code, message, " ").await
    }

    async fn write_multiple<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        messages: &[&str],
    ) -> io::Result<()> {
        for (index, message) in messages.iter().enumerate() {
            let is_last = index == messages.len() - 1;
            let separator = if is_last { " " } else { "-" };
            self.write_inner(writer, code, message, separator).await?;
        }
        Ok(())
    }
}

/// Splits a command line into its upper-cased verb and the rest.
fn split_command(line: &str) -> (String, &str) {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ') {
        Some((command, arg)) => (command.to_ascii_uppercase(), arg.trim()),
        None => (line.trim().to_ascii_uppercase(), ""),
    }
}

/// Extracts the path of a `MAIL FROM:` or `RCPT TO:` argument, dropping
/// any ESMTP parameters that follow it.
fn parse_path(arg: &str, prefix: &str) -> Option<String> {
    let head = arg.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let path = arg[prefix.len()..].trim_start().split_whitespace().next()?;
    if !path.starts_with('<') || !path.ends_with('>') {
        return None;
    }
    Some(strip_angle_brackets(path).to_string())
}

/// Reads one line, LF included, keeping at most `limit` bytes of it in
/// `line`. The rest of an overlong line is consumed and dropped.
///
/// Returns the number of bytes consumed and whether the line was cut,
/// zero bytes meaning the end of the stream.
pub async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut Vec<u8>,
    limit: usize,
) -> io::Result<(usize, bool)> {
    let mut read = 0;
    let mut truncated = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        let (chunk, complete) = match available.iter().position(|byte| *byte == b'\n') {
            Some(index) => (&available[..=index], true),
            None => (available, false),
        };
        let room = limit.saturating_sub(line.len());
        if chunk.len() > room {
            truncated = true;
        }
        line.extend_from_slice(&chunk[..chunk.len().min(room)]);

        let length = chunk.len();
        reader.consume(length);
        read += length;
        if complete {
            break;
        }
    }
    Ok((read, truncated))
}

/// Reads message data up to the terminating `.` line, undoing dot
/// stuffing. Returns `None` if the connection ends first.
///
/// The bytes are kept exactly as sent, signatures are computed over them.
pub async fn read_data<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_message_size: usize,
) -> io::Result<Option<Data>> {
    let mut data = Vec::new();
    let mut line = Vec::with_capacity(1024);
    let mut too_large = false;

    // room for a stuffed dot and the line ending on top of the content
    let line_limit = max_message_size.saturating_add(3);
    loop {
        line.clear();
        let (read, truncated) = read_line_bounded(reader, &mut line, line_limit).await?;
        if read == 0 {
            return Ok(None);
        }
        if !truncated && (line == b".\r\n" || line == b".\n") {
            break;
        }
        if too_large {
            continue;
        }
        if truncated {
            too_large = true;
            data = Vec::new();
            continue;
        }
        let content = match line.strip_prefix(b".") {
            Some(rest) => rest,
            None => &line[..],
        };
        if data.len() + content.len() > max_message_size {
            too_large = true;
            data = Vec::new();
            continue;
        }
        data.extend_from_slice(content);
    }

    Ok(Some(if too_large {
        Data::TooLarge
    } else {
        Data::Message(data)
    }))
}
