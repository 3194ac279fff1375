//! Bijective mapping between RDF terms and [`TermId`]s.
//!
//! Dictionary-allocated ids are sequence numbers per kind (IRI, blank node,
//! literal). The canonical term binary is both the `str2id` key and the
//! `id2str` value. Inline-encodable numeric literals never reach the
//! dictionary at all.

use crate::model::{BlankNode, Literal, LiteralRef, NamedNode, Term, TermRef};
use crate::storage::backend::{Db, Reader, WriteBatch};
use crate::storage::error::{CorruptionError, StorageError};
use crate::storage::term_id::{TermId, TermIdKind};
use crate::storage::{COUNTERS_CF, ID2STR_CF, STR2ID_CF};
use oxiri::Iri;
use oxrdf::vocab::xsd;
use oxsdatatypes::{DateTime, Decimal, Integer};
use rustc_hash::FxHashMap;
use std::str::FromStr;
use std::sync::Mutex;

/// Maximum canonical serialization size of a stored term.
pub const MAX_TERM_SIZE: usize = 16 * 1024;

/// How many allocations may happen between two counter checkpoints.
const COUNTER_CHECKPOINT_INTERVAL: u64 = 1000;
/// Added on top of a recovered checkpoint so ids emitted after the last
/// checkpoint but before a crash are never reallocated.
const COUNTER_RECOVERY_MARGIN: u64 = 1000;

const TERM_IRI: u8 = 0x01;
const TERM_BLANK_NODE: u8 = 0x02;
const TERM_STRING_LITERAL: u8 = 0x10;
const TERM_TYPED_LITERAL: u8 = 0x11;
const TERM_LANG_STRING_LITERAL: u8 = 0x12;

const COUNTER_KINDS: [(TermIdKind, &[u8]); 3] = [
    (TermIdKind::Iri, b"iri"),
    (TermIdKind::BlankNode, b"bnode"),
    (TermIdKind::Literal, b"literal"),
];

fn kind_slot(kind: TermIdKind) -> usize {
    match kind {
        TermIdKind::Iri => 0,
        TermIdKind::BlankNode => 1,
        TermIdKind::Literal => 2,
        _ => unreachable!("inline kinds have no sequence counter"),
    }
}

/// Returns the inline id of an inline-encodable term.
pub fn try_inline_term(term: TermRef<'_>) -> Option<TermId> {
    let TermRef::Literal(literal) = term else {
        return None;
    };
    if literal.language().is_some() {
        return None;
    }
    let value = literal.value();
    match literal.datatype() {
        dt if dt == xsd::INTEGER => TermId::from_integer(Integer::from_str(value).ok()?),
        dt if dt == xsd::DECIMAL => TermId::from_decimal(Decimal::from_str(value).ok()?),
        dt if dt == xsd::DATE_TIME => TermId::from_date_time(DateTime::from_str(value).ok()?),
        _ => None,
    }
}

/// Reconstructs the term behind an inline id.
pub fn decode_inline_term(id: TermId) -> Option<Term> {
    Some(match id.kind()? {
        TermIdKind::InlineInteger => Literal::from(id.as_integer()?).into(),
        TermIdKind::InlineDecimal => Literal::from(id.as_decimal()?).into(),
        TermIdKind::InlineDateTime => Literal::from(id.as_date_time()?).into(),
        _ => return None,
    })
}

/// Serializes a term into its canonical dictionary binary.
pub fn canonical_term_bytes(term: TermRef<'_>) -> Result<Vec<u8>, StorageError> {
    let mut buffer = Vec::with_capacity(64);
    match term {
        TermRef::NamedNode(node) => {
            let iri = node.as_str();
            if iri.is_empty() || iri.contains('\0') {
                return Err(StorageError::InvalidIri(iri.into()));
            }
            buffer.push(TERM_IRI);
            buffer.extend_from_slice(iri.as_bytes());
        }
        TermRef::BlankNode(node) => {
            buffer.push(TERM_BLANK_NODE);
            buffer.extend_from_slice(node.as_str().as_bytes());
        }
        TermRef::Literal(literal) => write_literal(&mut buffer, literal)?,
    }
    if buffer.len() > MAX_TERM_SIZE {
        return Err(StorageError::TermTooLarge {
            max: MAX_TERM_SIZE,
            actual: buffer.len(),
        });
    }
    Ok(buffer)
}

fn write_literal(buffer: &mut Vec<u8>, literal: LiteralRef<'_>) -> Result<(), StorageError> {
    if let Some(language) = literal.language() {
        let language_len = u16::try_from(language.len())
            .map_err(|_| CorruptionError::msg("Language tag longer than 64 KiB"))?;
        buffer.push(TERM_LANG_STRING_LITERAL);
        buffer.extend_from_slice(&language_len.to_be_bytes());
        buffer.extend_from_slice(language.as_bytes());
    } else if literal.datatype() == xsd::STRING {
        buffer.push(TERM_STRING_LITERAL);
    } else {
        let datatype = literal.datatype().as_str();
        let datatype_len = u16::try_from(datatype.len()).map_err(|_| StorageError::TermTooLarge {
            max: MAX_TERM_SIZE,
            actual: datatype.len(),
        })?;
        buffer.push(TERM_TYPED_LITERAL);
        buffer.extend_from_slice(&datatype_len.to_be_bytes());
        buffer.extend_from_slice(datatype.as_bytes());
    }
    buffer.extend_from_slice(literal.value().as_bytes());
    Ok(())
}

/// Parses a canonical dictionary binary back into a term.
pub fn parse_term_bytes(bytes: &[u8]) -> Result<Term, StorageError> {
    let (&tag, rest) = bytes
        .split_first()
        .ok_or_else(|| CorruptionError::msg("Empty term binary"))?;
    let utf8 = |bytes: &[u8]| -> Result<String, StorageError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CorruptionError::new(e).into())
    };
    Ok(match tag {
        TERM_IRI => NamedNode::new_unchecked(utf8(rest)?).into(),
        TERM_BLANK_NODE => BlankNode::new_unchecked(utf8(rest)?).into(),
        TERM_STRING_LITERAL => Literal::new_simple_literal(utf8(rest)?).into(),
        TERM_TYPED_LITERAL => {
            let (datatype, value) = split_prefixed(rest)?;
            Literal::new_typed_literal(utf8(value)?, NamedNode::new_unchecked(utf8(datatype)?))
                .into()
        }
        TERM_LANG_STRING_LITERAL => {
            let (language, value) = split_prefixed(rest)?;
            Literal::new_language_tagged_literal_unchecked(utf8(value)?, utf8(language)?).into()
        }
        _ => return Err(CorruptionError::msg(format!("Unknown term tag {tag}")).into()),
    })
}

fn split_prefixed(bytes: &[u8]) -> Result<(&[u8], &[u8]), StorageError> {
    if bytes.len() < 2 {
        return Err(CorruptionError::msg("Truncated term binary").into());
    }
    let len = usize::from(u16::from_be_bytes([bytes[0], bytes[1]]));
    let rest = &bytes[2..];
    if rest.len() < len {
        return Err(CorruptionError::msg("Truncated term binary").into());
    }
    Ok(rest.split_at(len))
}

struct Counters {
    values: [u64; 3],
    last_persisted: [u64; 3],
}

pub struct Dictionary {
    db: Db,
    counters: Mutex<Counters>,
}

impl Dictionary {
    /// Loads the dictionary state, applying the recovery margin on top of any
    /// persisted counter checkpoint.
    pub fn load(db: Db) -> Result<Self, StorageError> {
        let mut values = [0; 3];
        let reader = db.snapshot();
        for (kind, key) in COUNTER_KINDS {
            if let Some(bytes) = reader.get(COUNTERS_CF, key)? {
                let persisted = u64::from_be_bytes(
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| CorruptionError::msg("Invalid counter value"))?,
                );
                values[kind_slot(kind)] = persisted + COUNTER_RECOVERY_MARGIN;
            }
        }
        Ok(Self {
            db,
            counters: Mutex::new(Counters {
                values,
                last_persisted: values,
            }),
        })
    }

    /// Rebuilds the counters from the maximum allocated id per kind, for
    /// restores that lack the counter sidecar. The margin still applies.
    pub fn recover_from_scan(db: Db) -> Result<Self, StorageError> {
        let reader = db.snapshot();
        let mut values = [0; 3];
        for (kind, _) in COUNTER_KINDS {
            values[kind_slot(kind)] =
                max_allocated_sequence(&reader, kind)?.map_or(0, |max| max + COUNTER_RECOVERY_MARGIN);
        }
        Ok(Self {
            db,
            counters: Mutex::new(Counters {
                values,
                last_persisted: [0; 3],
            }),
        })
    }

    /// Returns the id of `term`, allocating a fresh sequence number on first
    /// encounter. Allocation stages the `str2id`/`id2str` pair and, every
    /// [`COUNTER_CHECKPOINT_INTERVAL`] allocations, a counter checkpoint into
    /// `batch`; all of it commits atomically with the triple writes.
    pub fn encode_term(
        &self,
        batch: &mut WriteBatch,
        staged: &mut FxHashMap<Vec<u8>, TermId>,
        term: TermRef<'_>,
    ) -> Result<TermId, StorageError> {
        if let Some(id) = try_inline_term(term) {
            return Ok(id);
        }
        let bytes = canonical_term_bytes(term)?;
        if let Some(id) = staged.get(&bytes) {
            return Ok(*id);
        }
        if let Some(existing) = self.db.get(STR2ID_CF, &bytes)? {
            let id = decode_stored_id(&existing)?;
            staged.insert(bytes, id);
            return Ok(id);
        }
        let kind = match term {
            TermRef::NamedNode(node) => {
                // Full validation only on first allocation; lookups of already
                // interned terms skip it
                Iri::parse(node.as_str()).map_err(|error| {
                    StorageError::InvalidIri(format!("{}: {error}", node.as_str()))
                })?;
                TermIdKind::Iri
            }
            TermRef::BlankNode(_) => TermIdKind::BlankNode,
            TermRef::Literal(_) => TermIdKind::Literal,
        };
        let id = {
            let mut counters = self.counters.lock().unwrap();
            let slot = kind_slot(kind);
            counters.values[slot] += 1;
            let sequence = counters.values[slot];
            if sequence - counters.last_persisted[slot] >= COUNTER_CHECKPOINT_INTERVAL {
                batch.insert(COUNTERS_CF, COUNTER_KINDS[slot].1, &sequence.to_be_bytes());
                counters.last_persisted[slot] = sequence;
            }
            TermId::from_sequence(kind, sequence)
        };
        batch.insert(STR2ID_CF, &bytes, &id.to_be_bytes());
        batch.insert(ID2STR_CF, &id.to_be_bytes(), &bytes);
        staged.insert(bytes, id);
        Ok(id)
    }

    /// Returns the id of `term` if it is inline or already allocated. Never allocates.
    pub fn lookup(&self, reader: &Reader, term: TermRef<'_>) -> Result<Option<TermId>, StorageError> {
        if let Some(id) = try_inline_term(term) {
            return Ok(Some(id));
        }
        let bytes = canonical_term_bytes(term)?;
        reader
            .get(STR2ID_CF, &bytes)?
            .map(|stored| decode_stored_id(&stored))
            .transpose()
    }

    /// Decodes an id back into its term. Inline kinds decode without I/O.
    pub fn decode(&self, reader: &Reader, id: TermId) -> Result<Term, StorageError> {
        if let Some(term) = decode_inline_term(id) {
            return Ok(term);
        }
        let bytes = reader.get(ID2STR_CF, &id.to_be_bytes())?.ok_or_else(|| {
            CorruptionError::msg(format!("Dangling term id {id:?} in an index"))
        })?;
        parse_term_bytes(&bytes)
    }

    /// Stages a checkpoint of the exact current counter values.
    pub fn stage_counters(&self, batch: &mut WriteBatch) {
        let mut counters = self.counters.lock().unwrap();
        for (slot, (_, key)) in COUNTER_KINDS.iter().enumerate() {
            batch.insert(COUNTERS_CF, key, &counters.values[slot].to_be_bytes());
            counters.last_persisted[slot] = counters.values[slot];
        }
    }

    /// Current counter values, for the backup sidecar.
    pub fn counter_values(&self) -> [u64; 3] {
        self.counters.lock().unwrap().values
    }

    /// How far the in-memory counters are ahead of their last checkpoint.
    pub fn counter_lag(&self) -> u64 {
        let counters = self.counters.lock().unwrap();
        counters
            .values
            .iter()
            .zip(&counters.last_persisted)
            .map(|(value, persisted)| value - persisted)
            .max()
            .unwrap_or(0)
    }

    /// Overwrites the counters from a backup sidecar, margin included.
    pub fn restore_counters(&self, values: [u64; 3]) {
        let mut counters = self.counters.lock().unwrap();
        for slot in 0..3 {
            counters.values[slot] = values[slot] + COUNTER_RECOVERY_MARGIN;
        }
    }
}

fn decode_stored_id(bytes: &[u8]) -> Result<TermId, StorageError> {
    Ok(TermId::from_be_bytes(bytes.try_into().map_err(|_| {
        CorruptionError::msg("Invalid term id length in str2id")
    })?))
}

/// Finds the largest allocated sequence number of a kind with a bounded number
/// of index probes (binary search over the id space driven by `seek`).
fn max_allocated_sequence(
    reader: &Reader,
    kind: TermIdKind,
) -> Result<Option<u64>, StorageError> {
    let kind_tag = kind as u8;
    let range_start = u64::from(kind_tag) << 60;
    let range_end = (u64::from(kind_tag) + 1) << 60;
    let mut iter = reader.scan_prefix(ID2STR_CF, &[])?;
    let mut best = None;
    let mut low = range_start;
    let mut high = range_end - 1;
    while low <= high {
        let middle = low + (high - low) / 2;
        iter.seek(&middle.to_be_bytes());
        let in_range = iter.key().and_then(|key| {
            let id = u64::from_be_bytes(key.try_into().ok()?);
            (id < range_end).then_some(id)
        });
        match in_range {
            Some(id) => {
                // A key >= middle exists in the kind range, so the maximum is >= id
                best = Some(id);
                if id >= high {
                    break;
                }
                low = id + 1;
            }
            None => {
                // Every key of the kind is < middle
                high = middle - 1;
            }
        }
    }
    iter.status()?;
    Ok(best.map(|id| id & ((1 << 60) - 1)))
}
