//! Append-only journal with per-author hash chains.
//!
//! Layout inside the journal directory:
//!
//! - `data`: every accepted message, framed exactly as on the wire
//! - `peers/<hex>`: per-peer cursors, see [`CursorStore`]
//!
//! Each author's messages form a chain: `seq` counts up from zero and `prev`
//! names the previous message. The journal keeps `{next_seq, last_id}` per
//! author and accepts only the message that extends the chain.

use crate::cursor::{CursorError, CursorStore};
use bytes::BytesMut;
use kit_core::{CodecError, Message, MsgId, Payload, UserId, VerifyError};
use kit_net::MessageCodec;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

const DATA_FILE: &str = "data";
const PEERS_DIR: &str = "peers";

/// Journal errors
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("cursor error: {0}")]
    Cursor(#[from] CursorError),
    #[error("invalid message: {0}")]
    Verify(#[from] VerifyError),
    #[error("message error: {0}")]
    Codec(#[from] CodecError),
    #[error(
        "chain error for {author}: got seq {seq} prev {prev}, expected seq {expected_seq} prev {expected_prev}"
    )]
    Chain {
        author: UserId,
        seq: u64,
        prev: MsgId,
        expected_seq: u64,
        expected_prev: MsgId,
    },
    #[error("corrupt journal at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
}

impl JournalError {
    /// The message was refused; the journal itself is fine.
    pub fn is_rejection(&self) -> bool {
        matches!(self, JournalError::Verify(_) | JournalError::Chain { .. })
    }
}

/// Position of one author's chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChainTip {
    pub next_seq: u64,
    pub last_id: MsgId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted,
    Duplicate,
}

pub struct Journal {
    dir: PathBuf,
    data: File,
    data_len: u64,
    messages: Vec<Message>,
    chains: HashMap<UserId, ChainTip>,
    ids: HashSet<MsgId>,
    cursors: CursorStore,
}

impl Journal {
    /// Open the journal in `dir`, replaying and validating everything stored.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, JournalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let cursors = CursorStore::open(dir.join(PEERS_DIR))?;
        let mut data = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(dir.join(DATA_FILE))?;

        let mut raw = Vec::new();
        data.read_to_end(&mut raw)?;
        let data_len = raw.len() as u64;

        let mut journal = Self {
            dir,
            data,
            data_len,
            messages: Vec::new(),
            chains: HashMap::new(),
            ids: HashSet::new(),
            cursors,
        };
        journal.replay(BytesMut::from(&raw[..]))?;
        info!(
            dir = %journal.dir.display(),
            messages = journal.messages.len(),
            authors = journal.chains.len(),
            "journal opened"
        );
        Ok(journal)
    }

    fn replay(&mut self, mut buf: BytesMut) -> Result<(), JournalError> {
        let mut codec = MessageCodec::new();
        let mut offset = 0u64;
        let corrupt = |offset, reason: String| JournalError::Corrupt { offset, reason };
        loop {
            let before = buf.len();
            let msg = match codec.decode(&mut buf) {
                Ok(Some(msg)) => msg,
                Ok(None) if buf.is_empty() => return Ok(()),
                Ok(None) => {
                    let reason = format!("truncated record, {} bytes left", buf.len());
                    return Err(corrupt(offset, reason));
                }
                Err(e) => return Err(corrupt(offset, e.to_string())),
            };
            msg.verify().map_err(|e| corrupt(offset, e.to_string()))?;
            match self.check_chain(&msg) {
                Ok(AppendOutcome::Accepted) => self.apply(msg),
                Ok(AppendOutcome::Duplicate) => {
                    return Err(corrupt(offset, format!("duplicate message {}", msg.id())))
                }
                Err(e) => return Err(corrupt(offset, e.to_string())),
            }
            offset += (before - buf.len()) as u64;
        }
    }

    fn check_chain(&self, msg: &Message) -> Result<AppendOutcome, JournalError> {
        let tip = self.chains.get(&msg.author()).copied().unwrap_or_default();
        if msg.seq() < tip.next_seq {
            return Ok(AppendOutcome::Duplicate);
        }
        if msg.seq() == tip.next_seq && msg.prev() == tip.last_id {
            return Ok(AppendOutcome::Accepted);
        }
        Err(JournalError::Chain {
            author: msg.author(),
            seq: msg.seq(),
            prev: msg.prev(),
            expected_seq: tip.next_seq,
            expected_prev: tip.last_id,
        })
    }

    fn apply(&mut self, msg: Message) {
        self.chains.insert(
            msg.author(),
            ChainTip {
                next_seq: msg.seq() + 1,
                last_id: msg.id(),
            },
        );
        self.ids.insert(msg.id());
        self.messages.push(msg);
    }

    fn persist(&mut self, msg: &Message) -> Result<(), JournalError> {
        let mut buf = Vec::with_capacity(msg.encoded_len());
        msg.encode_into(&mut buf);
        let written = self
            .data
            .write_all(&buf)
            .and_then(|()| self.data.sync_data());
        if let Err(e) = written {
            if let Err(te) = self.data.set_len(self.data_len) {
                warn!(error = %te, "failed to truncate partial journal record");
            }
            return Err(e.into());
        }
        self.data_len += buf.len() as u64;
        Ok(())
    }

    /// Validate and durably append `msg`.
    ///
    /// Messages already covered by the author's chain are reported as
    /// duplicates and leave the journal untouched.
    pub fn append(&mut self, msg: &Message) -> Result<AppendOutcome, JournalError> {
        msg.verify()?;
        if self.check_chain(msg)? == AppendOutcome::Duplicate {
            if !self.ids.contains(&msg.id()) {
                warn!(
                    author = %msg.author(),
                    seq = msg.seq(),
                    id = %msg.id(),
                    "fork: unknown message below chain tip"
                );
            }
            return Ok(AppendOutcome::Duplicate);
        }
        self.persist(msg)?;
        debug!(%msg, "appended");
        self.apply(msg.clone());
        Ok(AppendOutcome::Accepted)
    }

    /// Append a message received from `peer` and advance that peer's cursor.
    pub fn append_from_peer(
        &mut self,
        msg: &Message,
        peer: &UserId,
    ) -> Result<AppendOutcome, JournalError> {
        let outcome = self.append(msg)?;
        if let Err(e) = self.cursors.store(peer, &msg.id()) {
            warn!(%peer, error = %e, "failed to store peer cursor");
        }
        Ok(outcome)
    }

    /// Messages after `cursor`. An absent or unknown cursor selects everything.
    pub fn select_since(&self, cursor: Option<&MsgId>) -> &[Message] {
        let Some(cursor) = cursor else {
            return &self.messages;
        };
        match self.messages.iter().rposition(|m| m.id() == *cursor) {
            Some(pos) => &self.messages[pos + 1..],
            None => {
                debug!(%cursor, "unknown cursor, selecting everything");
                &self.messages
            }
        }
    }

    pub fn cursor_for(&self, peer: &UserId) -> Result<Option<MsgId>, CursorError> {
        self.cursors.load(peer)
    }

    /// Handle for reading cursors outside the journal owner.
    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    /// Owner of this journal: the author of the first message.
    pub fn identity(&self) -> Option<UserId> {
        self.messages.first().map(Message::author)
    }

    pub fn tip(&self, author: &UserId) -> Option<ChainTip> {
        self.chains.get(author).copied()
    }

    /// Unsealed message extending `author`'s chain.
    pub fn next_message(&self, author: UserId, payload: &Payload) -> Result<Message, JournalError> {
        let tip = self.tip(&author).unwrap_or_default();
        Ok(Message::new(author, tip.next_seq, tip.last_id, payload)?)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn contains(&self, id: &MsgId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kit_core::{Change, KeyPair, Register};
    use tempfile::tempdir;

    fn register(kp: &KeyPair) -> Message {
        let mut msg = Message::new(
            kp.user_id(),
            0,
            MsgId::ZERO,
            &Payload::from(Register {
                email: "a@example.com".into(),
            }),
        )
        .unwrap();
        msg.seal(kp).unwrap();
        msg
    }

    fn change(kp: &KeyPair, seq: u64, prev: MsgId, diff: &str) -> Message {
        let mut msg = Message::new(
            kp.user_id(),
            seq,
            prev,
            &Payload::from(Change { diff: diff.into() }),
        )
        .unwrap();
        msg.seal(kp).unwrap();
        msg
    }

    fn chain(kp: &KeyPair, n: usize) -> Vec<Message> {
        let mut out = vec![register(kp)];
        for i in 1..n {
            let prev = out[i - 1].id();
            out.push(change(kp, i as u64, prev, &format!("c{i}")));
        }
        out
    }

    #[test]
    fn test_chain_monotonicity() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        let kp = KeyPair::generate();
        let msgs = chain(&kp, 3);

        assert_eq!(journal.append(&msgs[0]).unwrap(), AppendOutcome::Accepted);
        assert_eq!(journal.append(&msgs[1]).unwrap(), AppendOutcome::Accepted);
        let tip = journal.tip(&kp.user_id()).unwrap();
        assert_eq!(tip, ChainTip { next_seq: 2, last_id: msgs[1].id() });

        // seq = next_seq - 1
        assert_eq!(journal.append(&msgs[1]).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(journal.tip(&kp.user_id()).unwrap(), tip);

        // seq = next_seq + 1
        let gap = change(&kp, 3, msgs[2].id(), "gap");
        assert!(matches!(
            journal.append(&gap),
            Err(JournalError::Chain { expected_seq: 2, .. })
        ));

        // right seq, wrong prev
        let wrong_prev = change(&kp, 2, msgs[0].id(), "fork");
        let err = journal.append(&wrong_prev).unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(journal.tip(&kp.user_id()).unwrap(), tip);
        assert_eq!(journal.len(), 2);
    }

    #[test]
    fn test_idempotent_append() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        let kp = KeyPair::generate();
        let m0 = register(&kp);

        assert_eq!(journal.append(&m0).unwrap(), AppendOutcome::Accepted);
        assert_eq!(journal.append(&m0).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(journal.len(), 1);
        assert_eq!(journal.identity(), Some(kp.user_id()));
    }

    #[test]
    fn test_invalid_message_rejected() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        let kp = KeyPair::generate();
        let mut m0 = register(&kp);
        m0.header.link = MsgId([1; 32]);

        let err = journal.append(&m0).unwrap_err();
        assert!(matches!(err, JournalError::Verify(VerifyError::BadSignature)));
        assert!(journal.is_empty());
    }

    #[test]
    fn test_reopen_restores_state() {
        let dir = tempdir().unwrap();
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let peer = UserId([9; 32]);
        let msgs_a = chain(&a, 3);
        let msgs_b = chain(&b, 2);
        {
            let mut journal = Journal::open(dir.path()).unwrap();
            for m in msgs_a.iter().chain(msgs_b.iter()) {
                journal.append(m).unwrap();
            }
            journal.append_from_peer(&msgs_b[1], &peer).unwrap();
        }

        let journal = Journal::open(dir.path()).unwrap();
        assert_eq!(journal.len(), 5);
        assert_eq!(journal.messages()[..3], msgs_a[..]);
        assert_eq!(journal.tip(&a.user_id()).unwrap().last_id, msgs_a[2].id());
        assert_eq!(journal.tip(&b.user_id()).unwrap().next_seq, 2);
        assert_eq!(journal.cursor_for(&peer).unwrap(), Some(msgs_b[1].id()));
        assert_eq!(journal.identity(), Some(a.user_id()));
    }

    #[test]
    fn test_corrupt_data_fails_open() {
        let dir = tempdir().unwrap();
        let kp = KeyPair::generate();
        {
            let mut journal = Journal::open(dir.path()).unwrap();
            for m in chain(&kp, 2) {
                journal.append(&m).unwrap();
            }
        }
        let path = dir.path().join(DATA_FILE);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            Journal::open(dir.path()),
            Err(JournalError::Corrupt { .. })
        ));

        bytes[last] ^= 0xff;
        bytes.truncate(last);
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            Journal::open(dir.path()),
            Err(JournalError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_stored_duplicate_is_corruption() {
        let dir = tempdir().unwrap();
        let kp = KeyPair::generate();
        let m0 = register(&kp);
        let mut bytes = m0.encode().to_vec();
        bytes.extend_from_slice(&m0.encode());
        fs::write(dir.path().join(DATA_FILE), &bytes).unwrap();
        assert!(matches!(
            Journal::open(dir.path()),
            Err(JournalError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_select_since() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        let kp = KeyPair::generate();
        let msgs = chain(&kp, 4);
        for m in &msgs {
            journal.append(m).unwrap();
        }

        assert_eq!(journal.select_since(None), &msgs[..]);
        assert_eq!(journal.select_since(Some(&msgs[1].id())), &msgs[2..]);
        assert!(journal.select_since(Some(&msgs[3].id())).is_empty());
        assert_eq!(journal.select_since(Some(&MsgId([7; 32]))), &msgs[..]);
    }

    #[test]
    fn test_cursor_advances_with_peer_appends() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        let kp = KeyPair::generate();
        let peer = UserId([3; 32]);
        let msgs = chain(&kp, 3);

        assert_eq!(journal.cursor_for(&peer).unwrap(), None);
        for m in &msgs {
            journal.append_from_peer(m, &peer).unwrap();
            assert_eq!(journal.cursor_for(&peer).unwrap(), Some(m.id()));
        }
        // an echoed duplicate acknowledges the same position
        assert_eq!(
            journal.append_from_peer(&msgs[2], &peer).unwrap(),
            AppendOutcome::Duplicate
        );
        assert_eq!(journal.cursor_for(&peer).unwrap(), Some(msgs[2].id()));

        // rejected messages leave it alone
        let gap = change(&kp, 9, msgs[2].id(), "gap");
        assert!(journal.append_from_peer(&gap, &peer).is_err());
        assert_eq!(journal.cursor_for(&peer).unwrap(), Some(msgs[2].id()));
    }

    #[test]
    fn test_failed_write_leaves_journal_unchanged() {
        let dir = tempdir().unwrap();
        let kp = KeyPair::generate();
        let msgs = chain(&kp, 3);
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.append(&msgs[0]).unwrap();
        journal.append(&msgs[1]).unwrap();
        let tip = journal.tip(&kp.user_id()).unwrap();

        // swap in a handle that cannot be written through
        let data_path = dir.path().join(DATA_FILE);
        journal.data = File::open(&data_path).unwrap();
        assert!(matches!(journal.append(&msgs[2]), Err(JournalError::Io(_))));
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.tip(&kp.user_id()).unwrap(), tip);
        assert!(!journal.contains(&msgs[2].id()));

        let reopened = Journal::open(dir.path()).unwrap();
        assert_eq!(reopened.messages(), &msgs[..2]);

        // the same message goes through once the file is writable again
        journal.data = OpenOptions::new().append(true).open(&data_path).unwrap();
        assert_eq!(journal.append(&msgs[2]).unwrap(), AppendOutcome::Accepted);
        assert_eq!(Journal::open(dir.path()).unwrap().messages(), &msgs[..]);
    }

    #[test]
    fn test_cursor_write_failure_is_not_fatal() {
        let dir = tempdir().unwrap();
        let kp = KeyPair::generate();
        let peer = UserId([4; 32]);
        let msgs = chain(&kp, 2);
        let mut journal = Journal::open(dir.path()).unwrap();

        // a plain file where the cursor directory should be
        let peers = dir.path().join(PEERS_DIR);
        fs::remove_dir_all(&peers).unwrap();
        fs::write(&peers, b"not a directory").unwrap();

        assert_eq!(
            journal.append_from_peer(&msgs[0], &peer).unwrap(),
            AppendOutcome::Accepted
        );
        assert_eq!(
            journal.append_from_peer(&msgs[0], &peer).unwrap(),
            AppendOutcome::Duplicate
        );
        assert!(journal.cursor_for(&peer).is_err());
        assert_eq!(
            journal.append_from_peer(&msgs[1], &peer).unwrap(),
            AppendOutcome::Accepted
        );
        drop(journal);

        fs::remove_file(&peers).unwrap();
        let reopened = Journal::open(dir.path()).unwrap();
        assert_eq!(reopened.messages(), &msgs[..]);
        assert_eq!(reopened.cursor_for(&peer).unwrap(), None);
    }

    #[test]
    fn test_next_message_extends_tip() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        let kp = KeyPair::generate();
        let m0 = register(&kp);
        journal.append(&m0).unwrap();

        let mut next = journal
            .next_message(kp.user_id(), &Payload::from(Change { diff: "x".into() }))
            .unwrap();
        next.seal(&kp).unwrap();
        assert_eq!(next.seq(), 1);
        assert_eq!(next.prev(), m0.id());
        assert_eq!(journal.append(&next).unwrap(), AppendOutcome::Accepted);
    }
}
