use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::crypto::{Kek, KeyBlock, MasterSecret, RecordCipher, AEAD_OVERHEAD};
use super::message::{
    Alert, AlertDescription, AlertLevel, ContentType, DtlsRecord, Header, MessageType,
    ProtocolVersion, Random, Sequence, HANDSHAKE_HEADER_LEN, MAX_SEQUENCE_NUMBER,
};
use super::window::ReplayWindow;
use super::Output;
use crate::buffer::{Buf, BufferPool};
use crate::timer::ExponentialBackoff;
use crate::{Config, Error, SeededRng};

/// Largest handshake message we are willing to reassemble.
const MAX_HANDSHAKE_LEN: usize = 16 * 1024;

/// How far ahead of the expected message_seq we buffer fragments.
const MAX_FUTURE_MESSAGES: u16 = 8;

/// Record layer and handshake plumbing shared by client and server.
///
/// The state machines in `client.rs` and `server.rs` only see whole handshake
/// messages in order. Fragment reassembly, retransmission, record protection
/// and anti-replay all live here.
pub struct Engine {
    config: Arc<Config>,

    /// Seedable random number generator for deterministic testing
    pub(crate) rng: SeededRng,

    is_client: bool,

    /// Pool of buffers
    buffers_free: BufferPool,

    /// Record counters for epoch 0. Kept apart from epoch 1 since a resend
    /// of an epoch 0 flight may happen after we moved on.
    sequence_epoch_0: Sequence,
    sequence_epoch_1: Sequence,

    /// Outgoing datagrams.
    queue_tx: VecDeque<Buf>,

    /// Handshake messages reassembled but not yet consumed, in message_seq order.
    handshakes: VecDeque<(MessageType, u16, Buf)>,

    /// Partially received handshake messages.
    reassembly: BTreeMap<u16, Reassembly>,

    /// Decrypted application data.
    app_data: VecDeque<Buf>,

    /// Protected records that arrived before we had keys.
    pending_protected: Vec<Buf>,

    cipher: Option<RecordCipher>,

    /// Epoch used for our own records. Moves to 1 with our ChangeCipherSpec.
    write_epoch: u16,

    peer_ccs: bool,
    peer_closed: bool,

    /// Server side: the first ClientHello decides the message_seq baseline.
    awaiting_first_hello: bool,

    /// Expected peer handshake sequence number
    peer_handshake_seq_no: u16,

    /// Next handshake message sequence number for sending
    next_handshake_seq_no: u16,

    /// Handshake messages hashed into Finished.
    transcript: Buf,

    replay: ReplayWindow,

    /// The records that have been sent in the current flight.
    flight_saved_records: Vec<Entry>,

    /// Set while parsing when the peer repeated an old message.
    resend_requested: bool,

    flight_backoff: ExponentialBackoff,
    flight_timeout: Timeout,

    /// Overall deadline for the handshake.
    connect_timeout: Timeout,

    /// Whether we are ready to release application data from poll_output.
    release_app_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timeout {
    Disabled,
    Unarmed,
    Armed(Instant),
}

#[derive(Debug)]
struct Entry {
    content_type: ContentType,
    epoch: u16,
    fragment: Buf,
}

#[derive(Debug)]
struct Reassembly {
    msg_type: MessageType,
    length: usize,
    body: Buf,
    /// Sorted, merged byte ranges received so far.
    ranges: Vec<(usize, usize)>,
}

impl Reassembly {
    fn new(msg_type: MessageType, length: usize, mut body: Buf) -> Self {
        body.clear();
        body.resize(length, 0);
        Reassembly {
            msg_type,
            length,
            body,
            ranges: Vec::new(),
        }
    }

    fn add(&mut self, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        self.body[offset..end].copy_from_slice(data);
        self.ranges.push((offset, end));
        self.ranges.sort_unstable();

        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(self.ranges.len());
        for (start, end) in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        self.ranges = merged;
    }

    fn is_complete(&self) -> bool {
        self.length == 0 || self.ranges.first() == Some(&(0, self.length))
    }
}

impl Engine {
    pub fn new(config: Arc<Config>, is_client: bool, personalization: &[u8]) -> Self {
        let mut rng = SeededRng::with_personalization(config.rng_seed(), personalization);

        let flight_backoff =
            ExponentialBackoff::new(config.flight_start_rto(), config.flight_retries(), &mut rng);

        Self {
            config,
            rng,
            is_client,
            buffers_free: BufferPool::default(),
            sequence_epoch_0: Sequence::new(0),
            sequence_epoch_1: Sequence::new(1),
            queue_tx: VecDeque::new(),
            handshakes: VecDeque::new(),
            reassembly: BTreeMap::new(),
            app_data: VecDeque::new(),
            pending_protected: Vec::new(),
            cipher: None,
            write_epoch: 0,
            peer_ccs: false,
            peer_closed: false,
            awaiting_first_hello: !is_client,
            peer_handshake_seq_no: 0,
            next_handshake_seq_no: 0,
            transcript: Buf::new(),
            replay: ReplayWindow::new(),
            flight_saved_records: Vec::new(),
            resend_requested: false,
            flight_backoff,
            flight_timeout: Timeout::Unarmed,
            connect_timeout: Timeout::Unarmed,
            release_app_data: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn parse_packet(&mut self, packet: &[u8]) -> Result<(), Error> {
        let mut input = packet;

        while !input.is_empty() {
            let (rest, record) = match DtlsRecord::parse(input) {
                Ok(v) => v,
                Err(e) => {
                    debug!("Dropping malformed datagram tail ({} bytes): {:?}", input.len(), e);
                    break;
                }
            };
            input = rest;
            self.handle_record(record)?;
        }

        if mem::take(&mut self.resend_requested) {
            self.flight_resend("peer retransmission")?;
        }

        Ok(())
    }

    fn handle_record(&mut self, record: DtlsRecord<'_>) -> Result<(), Error> {
        let epoch = record.sequence.epoch;

        match record.version {
            ProtocolVersion::DTLS1_2 => {}
            // Some stacks send the first ClientHello with a 1.0 record version.
            ProtocolVersion::DTLS1_0 if epoch == 0 => {}
            v => {
                debug!("Dropping record with version {:?}", v);
                return Ok(());
            }
        }

        if epoch == 0 {
            return self.handle_plaintext(record.content_type, record.fragment, false);
        }

        if epoch != 1 {
            debug!("Dropping record for unknown epoch {}", epoch);
            return Ok(());
        }

        if self.cipher.is_none() {
            if self.pending_protected.len() >= self.config.max_queue_rx() {
                return Err(Error::ReceiveQueueFull);
            }
            trace!("Holding protected record {:?} until keys are ready", record.sequence);
            let mut buf = self.buffers_free.pop();
            record.serialize(buf.as_mut_vec());
            self.pending_protected.push(buf);
            return Ok(());
        }

        let mut plaintext = self.buffers_free.pop();
        let opened = match &self.cipher {
            Some(cipher) => cipher.open(
                record.content_type,
                record.sequence,
                record.fragment,
                &mut plaintext,
            ),
            None => Err(Error::InvalidState("no record cipher")),
        };

        if let Err(e) = opened {
            self.buffers_free.push(plaintext);
            if self.release_app_data {
                // Once connected, forged or corrupted records are silently discarded.
                debug!("Dropping record {:?}: {}", record.sequence, e);
                return Ok(());
            }
            return Err(e);
        }

        if !self.replay.accept(record.sequence) {
            trace!("Dropping replayed record {:?}", record.sequence);
            self.buffers_free.push(plaintext);
            return Ok(());
        }

        let result = self.handle_plaintext(record.content_type, &plaintext, true);
        self.buffers_free.push(plaintext);
        result
    }

    fn handle_plaintext(
        &mut self,
        content_type: ContentType,
        data: &[u8],
        protected: bool,
    ) -> Result<(), Error> {
        match content_type {
            ContentType::Handshake => {
                let mut input = data;
                while !input.is_empty() {
                    let (rest, (header, fragment)) = Header::parse_fragment(input)?;
                    input = rest;
                    self.insert_fragment(header, fragment)?;
                }
                Ok(())
            }
            ContentType::ChangeCipherSpec => {
                if data != [1] {
                    return Err(Error::UnexpectedMessage(
                        "malformed ChangeCipherSpec".to_string(),
                    ));
                }
                trace!("Peer ChangeCipherSpec");
                self.peer_ccs = true;
                Ok(())
            }
            ContentType::Alert => {
                let (_, alert) = Alert::parse(data)?;
                if alert.description == AlertDescription::CloseNotify {
                    debug!("Peer sent close_notify");
                    self.peer_closed = true;
                    return Ok(());
                }
                if alert.level == AlertLevel::Fatal {
                    warn!("Peer sent fatal alert {:?}", alert.description);
                    return Err(Error::Alert(alert.description));
                }
                debug!("Ignoring warning alert {:?}", alert.description);
                Ok(())
            }
            ContentType::ApplicationData => {
                if !protected {
                    debug!("Dropping unprotected application data");
                    return Ok(());
                }
                if self.app_data.len() >= self.config.max_queue_rx() {
                    return Err(Error::ReceiveQueueFull);
                }
                let mut buf = self.buffers_free.pop();
                buf.extend_from_slice(data);
                self.app_data.push_back(buf);
                Ok(())
            }
            ContentType::Unknown(v) => {
                debug!("Dropping record of unknown content type {}", v);
                Ok(())
            }
        }
    }

    fn insert_fragment(&mut self, header: Header, fragment: &[u8]) -> Result<(), Error> {
        if self.awaiting_first_hello {
            if header.msg_type != MessageType::ClientHello {
                debug!("Dropping {:?} before ClientHello", header.msg_type);
                return Ok(());
            }
            // Our message_seq follows the ClientHello that passed the cookie check.
            self.peer_handshake_seq_no = header.message_seq;
            self.next_handshake_seq_no = header.message_seq;
            self.awaiting_first_hello = false;
        }

        if header.message_seq < self.peer_handshake_seq_no {
            // The peer did not see our last flight.
            if !self.flight_saved_records.is_empty() {
                self.resend_requested = true;
            }
            return Ok(());
        }

        if header.message_seq - self.peer_handshake_seq_no > MAX_FUTURE_MESSAGES {
            debug!("Dropping handshake too far ahead: {}", header.message_seq);
            return Ok(());
        }

        let length = header.length as usize;
        if length > MAX_HANDSHAKE_LEN {
            return Err(Error::TooLarge {
                what: "handshake message",
                len: length,
                max: MAX_HANDSHAKE_LEN,
            });
        }

        if !self.reassembly.contains_key(&header.message_seq) {
            let body = self.buffers_free.pop();
            self.reassembly.insert(
                header.message_seq,
                Reassembly::new(header.msg_type, length, body),
            );
        }

        let Some(entry) = self.reassembly.get_mut(&header.message_seq) else {
            return Ok(());
        };

        if entry.msg_type != header.msg_type || entry.length != length {
            return Err(Error::UnexpectedMessage(format!(
                "inconsistent fragments for message_seq {}",
                header.message_seq
            )));
        }

        entry.add(header.fragment_offset as usize, fragment);

        while let Some(entry) = self.reassembly.get(&self.peer_handshake_seq_no) {
            if !entry.is_complete() {
                break;
            }
            if self.handshakes.len() >= self.config.max_queue_rx() {
                return Err(Error::ReceiveQueueFull);
            }
            let seq = self.peer_handshake_seq_no;
            if let Some(done) = self.reassembly.remove(&seq) {
                trace!("Received {:?} seq {}", done.msg_type, seq);
                self.handshakes.push_back((done.msg_type, seq, done.body));
            }
            self.peer_handshake_seq_no += 1;
        }

        Ok(())
    }

    /// Type of the next complete handshake message, if any.
    pub fn peek_handshake(&self) -> Option<MessageType> {
        self.handshakes.front().map(|(t, _, _)| *t)
    }

    /// Take the next handshake message if it is of the `wanted` type, adding
    /// it to the transcript.
    pub fn next_handshake(&mut self, wanted: MessageType) -> Result<Option<Buf>, Error> {
        let Some(msg_type) = self.peek_handshake() else {
            return Ok(None);
        };

        if msg_type != wanted {
            return Err(Error::UnexpectedMessage(format!(
                "expected {:?}, got {:?}",
                wanted, msg_type
            )));
        }

        let Some((msg_type, seq, body)) = self.handshakes.pop_front() else {
            return Ok(None);
        };

        Header::whole(msg_type, body.len(), seq).serialize(self.transcript.as_mut_vec());
        self.transcript.extend_from_slice(&body);

        Ok(Some(body))
    }

    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        if self.connect_timeout == Timeout::Unarmed {
            debug!(
                "Connect timeout in: {:.03}s",
                self.config.handshake_timeout().as_secs_f32()
            );
            self.connect_timeout = Timeout::Armed(now + self.config.handshake_timeout());
        }
        if self.flight_timeout == Timeout::Unarmed && !self.flight_saved_records.is_empty() {
            trace!(
                "Flight timeout in: {:.03}s",
                self.flight_backoff.rto().as_secs_f32()
            );
            self.flight_timeout = Timeout::Armed(now + self.flight_backoff.rto());
        }

        if let Timeout::Armed(connect_timeout) = self.connect_timeout {
            if now >= connect_timeout {
                return Err(Error::Timeout("connect"));
            }
        }

        let Timeout::Armed(flight_timeout) = self.flight_timeout else {
            return Ok(());
        };

        if now >= flight_timeout {
            if self.flight_backoff.can_retry() {
                self.flight_backoff.attempt(&mut self.rng);
                debug!(
                    "Re-arm flight timeout due to resend in {:.03}s",
                    self.flight_backoff.rto().as_secs_f32()
                );
                self.flight_timeout = Timeout::Armed(now + self.flight_backoff.rto());
                self.flight_resend("flight timeout")?;
            } else {
                return Err(Error::Timeout("handshake"));
            }
        }

        Ok(())
    }

    /// Next packet, application data, peer close or timeout, in that order.
    ///
    /// Output that does not fit `buf` stays queued and is reported as
    /// [`Output::BufferTooSmall`].
    pub fn poll_output<'a>(&mut self, buf: &'a mut [u8], now: Instant) -> Output<'a> {
        if let Some(needed) = self.pending_output_len().filter(|n| *n > buf.len()) {
            warn!("Output buffer too small: {} > {}", needed, buf.len());
            return Output::BufferTooSmall { needed };
        }
        let buf = match self.poll_packet_tx(buf) {
            Ok(p) => return Output::Packet(p),
            Err(b) => b,
        };
        if let Ok(d) = self.poll_app_data(buf) {
            return Output::ApplicationData(d);
        }
        if self.take_peer_closed() {
            return Output::PeerClosed;
        }
        Output::Timeout(self.poll_timeout(now))
    }

    /// Length of whatever `poll_output` would copy out next.
    fn pending_output_len(&self) -> Option<usize> {
        if let Some(p) = self.queue_tx.front() {
            return Some(p.len());
        }
        if self.release_app_data {
            return self.app_data.front().map(|d| d.len());
        }
        None
    }

    fn poll_app_data<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a [u8], &'a mut [u8]> {
        if !self.release_app_data {
            return Err(buf);
        }
        let Some(data) = self.app_data.pop_front() else {
            return Err(buf);
        };
        let len = data.len();
        buf[..len].copy_from_slice(&data);
        self.buffers_free.push(data);
        Ok(&buf[..len])
    }

    fn poll_packet_tx<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a [u8], &'a mut [u8]> {
        let Some(p) = self.queue_tx.pop_front() else {
            return Err(buf);
        };
        let len = p.len();
        buf[..len].copy_from_slice(&p);
        self.buffers_free.push(p);
        Ok(&buf[..len])
    }

    pub fn poll_timeout(&self, now: Instant) -> Instant {
        const DISTANT_FUTURE: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

        match (self.connect_timeout, self.flight_timeout) {
            (Timeout::Armed(c), Timeout::Armed(f)) => c.min(f),
            (Timeout::Armed(c), _) => c,
            (_, Timeout::Armed(f)) => f,
            // Unarmed timers are armed by the next handle_timeout.
            (Timeout::Unarmed, _) | (_, Timeout::Unarmed) => now,
            _ => now + DISTANT_FUTURE,
        }
    }

    pub fn flight_begin(&mut self, flight_no: u8) {
        debug!("Begin flight {}", flight_no);
        self.flight_backoff.reset(&mut self.rng);
        for entry in self.flight_saved_records.drain(..) {
            self.buffers_free.push(entry.fragment);
        }
        self.flight_timeout = Timeout::Unarmed;
    }

    /// Handshake done. Saved records stay so a peer retransmission can
    /// still be answered.
    pub fn flight_stop_resend_timers(&mut self) {
        debug!("Stop connect and flight timeouts");
        self.flight_timeout = Timeout::Disabled;
        self.connect_timeout = Timeout::Disabled;
    }

    fn flight_resend(&mut self, reason: &str) -> Result<(), Error> {
        debug!("Resending flight due to {}", reason);
        let records = mem::take(&mut self.flight_saved_records);

        let mut result = Ok(());
        for entry in &records {
            result = self.create_record(entry.content_type, entry.epoch, false, |fragment| {
                fragment.extend_from_slice(&entry.fragment);
            });
            if result.is_err() {
                break;
            }
        }

        self.flight_saved_records = records;
        result
    }

    /// Serialize one record into the outgoing datagram queue, packing records
    /// into the last datagram while it stays within the MTU.
    pub fn create_record<F>(
        &mut self,
        content_type: ContentType,
        epoch: u16,
        save_fragment: bool,
        f: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut Buf),
    {
        if epoch >= 1 && self.cipher.is_none() {
            return Err(Error::InvalidState("write keys not installed"));
        }

        let mut fragment = self.buffers_free.pop();
        f(&mut fragment);

        if save_fragment {
            let mut clone = self.buffers_free.pop();
            clone.extend_from_slice(&fragment);
            self.flight_saved_records.push(Entry {
                content_type,
                epoch,
                fragment: clone,
            });
        }

        let overhead = if epoch >= 1 { AEAD_OVERHEAD } else { 0 };
        let record_wire_len = DtlsRecord::HEADER_LEN + fragment.len() + overhead;

        let can_append = self
            .queue_tx
            .back()
            .map(|b| b.len() + record_wire_len <= self.config.mtu())
            .unwrap_or(false);

        if !can_append && self.queue_tx.len() >= self.config.max_queue_tx() {
            warn!(
                "Transmit queue full (max {})",
                self.config.max_queue_tx()
            );
            self.buffers_free.push(fragment);
            return Err(Error::TransmitQueueFull);
        }

        let sequence = if epoch == 0 {
            self.sequence_epoch_0
        } else {
            self.sequence_epoch_1
        };
        if sequence.sequence_number > MAX_SEQUENCE_NUMBER {
            self.buffers_free.push(fragment);
            return Err(Error::CryptoError("record sequence exhausted".into()));
        }

        let mut datagram = match can_append {
            true => self.queue_tx.pop_back().unwrap_or_default(),
            false => self.buffers_free.pop(),
        };

        let sealed = if epoch == 0 {
            DtlsRecord::serialize_header(
                content_type,
                ProtocolVersion::DTLS1_2,
                sequence,
                fragment.len(),
                datagram.as_mut_vec(),
            );
            datagram.extend_from_slice(&fragment);
            Ok(())
        } else {
            DtlsRecord::serialize_header(
                content_type,
                ProtocolVersion::DTLS1_2,
                sequence,
                fragment.len() + AEAD_OVERHEAD,
                datagram.as_mut_vec(),
            );
            match &self.cipher {
                Some(cipher) => cipher.seal(content_type, sequence, &fragment, &mut datagram),
                None => Err(Error::InvalidState("write keys not installed")),
            }
        };

        self.buffers_free.push(fragment);
        sealed?;

        if epoch == 0 {
            self.sequence_epoch_0.sequence_number += 1;
        } else {
            self.sequence_epoch_1.sequence_number += 1;
        }

        self.queue_tx.push_back(datagram);

        Ok(())
    }

    /// Create a handshake message, fragmenting it across records to fit the MTU.
    pub fn create_handshake<F>(&mut self, msg_type: MessageType, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Vec<u8>),
    {
        let mut body = self.buffers_free.pop();
        f(body.as_mut_vec());

        let message_seq = self.next_handshake_seq_no;
        self.next_handshake_seq_no += 1;

        let whole = Header::whole(msg_type, body.len(), message_seq);
        whole.serialize(self.transcript.as_mut_vec());
        self.transcript.extend_from_slice(&body);

        let epoch = msg_type.epoch();
        let total_len = body.len();
        let aead_overhead = if epoch >= 1 { AEAD_OVERHEAD } else { 0 };
        let fixed_overhead = DtlsRecord::HEADER_LEN + HANDSHAKE_HEADER_LEN + aead_overhead;
        let mut offset: usize = 0;

        // At least one record, even for an empty body (ServerHelloDone).
        loop {
            let used = self.queue_tx.back().map(|b| b.len()).unwrap_or(0);
            let available_in_current = self.config.mtu().saturating_sub(used);

            let available_for_body = if available_in_current > fixed_overhead {
                available_in_current - fixed_overhead
            } else {
                self.config.mtu().saturating_sub(fixed_overhead)
            };

            let chunk_len = (total_len - offset).min(available_for_body);

            let header = Header {
                msg_type,
                length: total_len as u32,
                message_seq,
                fragment_offset: offset as u32,
                fragment_length: chunk_len as u32,
            };
            let chunk = &body[offset..offset + chunk_len];

            self.create_record(ContentType::Handshake, epoch, true, |fragment| {
                header.serialize(fragment.as_mut_vec());
                fragment.extend_from_slice(chunk);
            })?;

            offset += chunk_len;
            if offset >= total_len {
                break;
            }
        }

        trace!("Sent {:?} seq {} ({} bytes)", msg_type, message_seq, total_len);
        self.buffers_free.push(body);

        Ok(())
    }

    pub fn send_change_cipher_spec(&mut self) -> Result<(), Error> {
        self.create_record(ContentType::ChangeCipherSpec, 0, true, |fragment| {
            fragment.push(1);
        })?;
        self.write_epoch = 1;
        Ok(())
    }

    pub fn send_alert(&mut self, alert: Alert) -> Result<(), Error> {
        let epoch = self.write_epoch;
        self.create_record(ContentType::Alert, epoch, false, |fragment| {
            alert.serialize(fragment.as_mut_vec());
        })
    }

    pub fn send_application_data(&mut self, data: &[u8]) -> Result<(), Error> {
        self.create_record(ContentType::ApplicationData, 1, false, |fragment| {
            fragment.extend_from_slice(data);
        })
    }

    /// Expand `master` into record keys, install them, and return the KEK.
    pub fn install_keys(
        &mut self,
        master: &MasterSecret,
        client_random: &Random,
        server_random: &Random,
    ) -> Result<Kek, Error> {
        let key_block = KeyBlock::derive(master, client_random, server_random)?;
        let cipher = RecordCipher::new(&key_block, self.is_client)?;
        self.install_cipher(cipher)?;
        Ok(key_block.kek())
    }

    /// Install keys for epoch 1 and process protected records that arrived early.
    fn install_cipher(&mut self, cipher: RecordCipher) -> Result<(), Error> {
        debug!("Record protection installed");
        self.cipher = Some(cipher);

        let pending = mem::take(&mut self.pending_protected);
        for buf in pending {
            let result = self.parse_packet(&buf);
            self.buffers_free.push(buf);
            result?;
        }
        Ok(())
    }

    pub fn has_peer_ccs(&self) -> bool {
        self.peer_ccs
    }

    pub fn take_peer_closed(&mut self) -> bool {
        mem::take(&mut self.peer_closed)
    }

    pub fn release_application_data(&mut self) {
        self.release_app_data = true;
    }

    pub fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    /// The first ClientHello and HelloVerifyRequest are not part of the transcript.
    pub fn reset_for_hello_verify_request(&mut self) {
        self.transcript.clear();
        self.flight_begin(1);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("is_client", &self.is_client)
            .field("write_epoch", &self.write_epoch)
            .field("peer_handshake_seq_no", &self.peer_handshake_seq_no)
            .field("next_handshake_seq_no", &self.next_handshake_seq_no)
            .field("queue_tx", &self.queue_tx.len())
            .field("connected", &self.release_app_data)
            .finish()
    }
}
