//! Stitching of partial sessions that span several card files.
//!
//! Files belonging to one therapy run share an 8-hex-digit stem
//! (`0000001A.002`, `0000001A.005`, ...). Every session whose source carries
//! such a stem is fused with the others carrying the same stem.

use crate::session::types::Session;
use std::collections::HashMap;
use tracing::debug;

/// File extensions that belong to a stitched session.
const SESSION_EXTENSIONS: &[&str] = &["000", "001", "002", "005", "006"];

/// Extract the merge key (upper-cased hex stem) from a source label.
pub fn session_key(source: &str) -> Option<String> {
    let file_name = source.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(source);
    let (stem, ext) = file_name.rsplit_once('.')?;

    if stem.len() != 8 || !stem.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    if !SESSION_EXTENSIONS.contains(&ext) {
        return None;
    }

    Some(stem.to_ascii_uppercase())
}

/// Fuse sessions sharing a key; keyless sessions pass through untouched.
///
/// Output order follows the first appearance of each key (or keyless
/// session) in the input. Within a key the candidates are ordered by
/// `(start, source, session_id)` before folding, so the fused result does not
/// depend on the order the files were decoded in.
pub fn merge_sessions(sessions: Vec<Session>) -> Vec<Session> {
    let mut slots: Vec<Slot> = Vec::new();
    let mut key_slots: HashMap<String, usize> = HashMap::new();

    for session in sessions {
        match session_key(&session.source) {
            Some(key) => {
                if let Some(&idx) = key_slots.get(&key) {
                    if let Slot::Group(group) = &mut slots[idx] {
                        group.push(session);
                    }
                } else {
                    key_slots.insert(key, slots.len());
                    slots.push(Slot::Group(vec![session]));
                }
            }
            None => slots.push(Slot::Single(session)),
        }
    }

    slots
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::Single(session) => Some(session),
            Slot::Group(group) => fuse_group(group),
        })
        .collect()
}

enum Slot {
    Single(Session),
    Group(Vec<Session>),
}

fn fuse_group(mut group: Vec<Session>) -> Option<Session> {
    group.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| a.source.cmp(&b.source))
            .then_with(|| a.session_id.cmp(&b.session_id))
    });

    let count = group.len();
    let mut iter = group.into_iter();
    let first = iter.next()?;
    let mut fused = iter.fold(first, merge_pair);

    fused.events.sort_by_key(|e| e.timestamp);
    fused
        .signals
        .sort_by(|a, b| a.signal.cmp(&b.signal).then_with(|| a.timestamp.cmp(&b.timestamp)));

    if count > 1 {
        debug!(
            source = %fused.source,
            parts = count,
            events = fused.events.len(),
            "fused session parts"
        );
    }
    Some(fused)
}

/// Fuse two parts of one session, preferring the richer value per field.
pub fn merge_pair(mut a: Session, b: Session) -> Session {
    a.start = a.start.min(b.start);
    a.end = a.end.max(b.end);

    a.events.extend(b.events);
    a.signals.extend(b.signals);

    // Larger waveform wins; overlapping copies are never concatenated.
    let b_wave_len = b.waveform.as_ref().map_or(0, |w| w.len());
    let a_wave_len = a.waveform.as_ref().map_or(0, |w| w.len());
    if b_wave_len > a_wave_len {
        a.waveform = b.waveform;
    }

    let b_breaths = b.breaths.as_ref().map_or(0, |v| v.len());
    let a_breaths = a.breaths.as_ref().map_or(0, |v| v.len());
    if b_breaths > a_breaths {
        a.breaths = b.breaths;
    }

    if a.settings.is_none() {
        a.settings = b.settings;
    }

    // Interval chunks in sibling files describe the same run.
    a.interval_secs = a.interval_secs.max(b.interval_secs);

    if b.source.len() > a.source.len() {
        a.source = b.source;
    }

    a
}
