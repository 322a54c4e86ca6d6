//! Server-side PV-name filters: a wire name may carry `.{json}` or
//! `.[slice]` suffixes that rewrite reads and gate subscription events.
//! Filters compose left-to-right; invalid filter text fails channel creation.

use crate::dbr::{DbrMetadata, DbrValue, TimeStamp};
use crate::support::{CaResult, DecodeError};
use hashbrown::HashMap;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncMode {
    Before,
    After,
    While,
    Unless,
    First,
    Last,
}

impl SyncMode {
    fn parse(text: &str) -> Option<SyncMode> {
        Some(match text {
            "before" => SyncMode::Before,
            "after" => SyncMode::After,
            "while" => SyncMode::While,
            "unless" => SyncMode::Unless,
            "first" => SyncMode::First,
            "last" => SyncMode::Last,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FilterKind {
    /// `[start:stop:step]`, stop exclusive, step ≥ 1.
    Slice { start: usize, stop: Option<usize>, step: usize },
    /// `{"ts":{}}`: readings carry the current wall clock.
    Timestamp,
    /// `{"dbnd":{"abs":X}}` / `{"dbnd":{"rel":X}}`.
    DeadbandAbs(f64),
    DeadbandRel(f64),
    /// `{"sync":{"m":MODE,"s":STATE}}`.
    Sync { mode: SyncMode, state: String },
}

/// Per-filter runtime state used by the event gates.
#[derive(Debug, Default)]
struct FilterState {
    last_emitted: Option<f64>,
    last_active: bool,
    held: Option<(DbrMetadata, DbrValue)>,
}

/// Named sync states shared between the server (which flips them) and the
/// subscription gates (which sample them at delivery time).
#[derive(Clone, Default)]
pub struct SyncStates {
    inner: Arc<Mutex<HashMap<String, bool>>>,
}

impl SyncStates {
    #[inline]
    pub fn new() -> SyncStates {
        SyncStates::default()
    }

    pub fn set(&self, name: &str, active: bool) {
        let mut states = self.inner.lock().expect("Sync state table poisoned");
        states.insert(name.to_string(), active);
    }

    pub fn is_active(&self, name: &str) -> bool {
        let states = self.inner.lock().expect("Sync state table poisoned");
        states.get(name).copied().unwrap_or(false)
    }
}

/// An ordered filter pipeline attached to one channel or subscription.
#[derive(Debug, Default)]
pub struct FilterChain {
    filters: Vec<(FilterKind, FilterState)>,
}

impl FilterChain {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Clones the pipeline with fresh runtime state, for attaching the
    /// channel's filters to a new subscription.
    pub fn fresh(&self) -> FilterChain {
        FilterChain {
            filters: self.filters.iter().map(|(kind, _)| (kind.clone(), FilterState::default())).collect(),
        }
    }

    /// Seeds the gate state from the first reading delivered at
    /// registration: the dead-band references it and the sync gates start
    /// from the current state instead of a synthetic inactive one.
    pub fn prime(&mut self, values: &DbrValue, states: &SyncStates) {
        for (kind, state) in self.filters.iter_mut() {
            match kind {
                FilterKind::DeadbandAbs(_) | FilterKind::DeadbandRel(_) => {
                    state.last_emitted = values.scalar_f64(0);
                }
                FilterKind::Sync { state: name, .. } => {
                    state.last_active = states.is_active(name);
                }
                _ => (),
            }
        }
    }

    /// Applies the read-path rewriters (slice, timestamp substitution).
    pub fn apply_read(&self, metadata: DbrMetadata, values: DbrValue, now: TimeStamp) -> (DbrMetadata, DbrValue) {
        let mut metadata = metadata;
        let mut values = values;

        for (kind, _) in &self.filters {
            match kind {
                FilterKind::Slice { start, stop, step } => {
                    values = values.select(&slice_indices(*start, *stop, *step, values.len()));
                }
                FilterKind::Timestamp => stamp(&mut metadata, now),
                _ => (),
            }
        }

        (metadata, values)
    }

    /// Runs one subscription event through the pipeline. Gating filters may
    /// suppress the event or release a previously buffered one, so the result
    /// is a (possibly empty) batch.
    pub fn filter_event(
        &mut self,
        metadata: DbrMetadata,
        values: DbrValue,
        states: &SyncStates,
        now: TimeStamp,
    ) -> Vec<(DbrMetadata, DbrValue)> {
        let mut batch = vec![(metadata, values)];

        for (kind, state) in self.filters.iter_mut() {
            match kind {
                FilterKind::Slice { start, stop, step } => {
                    for (_, values) in batch.iter_mut() {
                        *values = values.select(&slice_indices(*start, *stop, *step, values.len()));
                    }
                }

                FilterKind::Timestamp => {
                    for (metadata, _) in batch.iter_mut() {
                        stamp(metadata, now);
                    }
                }

                FilterKind::DeadbandAbs(band) | FilterKind::DeadbandRel(band) => {
                    let band = *band;
                    let relative = matches!(kind, FilterKind::DeadbandRel(_));

                    batch.retain(|(_, values)| match values.scalar_f64(0) {
                        Some(scalar) => {
                            let pass = match state.last_emitted {
                                // The first event always passes.
                                None => true,
                                Some(last) => {
                                    let delta = (scalar - last).abs();
                                    if relative {
                                        delta >= band * last.abs()
                                    } else {
                                        delta >= band
                                    }
                                }
                            };

                            if pass {
                                state.last_emitted = Some(scalar);
                            }
                            pass
                        }
                        // Non-numeric readings are never dead-banded.
                        None => true,
                    });
                }

                FilterKind::Sync { mode, state: name } => {
                    let active = states.is_active(name);
                    let mut next = Vec::new();

                    for event in batch.drain(..) {
                        match mode {
                            SyncMode::While => {
                                if active {
                                    next.push(event);
                                }
                            }
                            SyncMode::Unless => {
                                if !active {
                                    next.push(event);
                                }
                            }
                            SyncMode::First => {
                                if active && !state.last_active {
                                    next.push(event);
                                }
                            }
                            SyncMode::After => {
                                if !active && state.last_active {
                                    next.push(event);
                                }
                            }
                            SyncMode::Before => {
                                if active {
                                    // Entering the state releases the reading
                                    // buffered just before it.
                                    if !state.last_active {
                                        if let Some(held) = state.held.take() {
                                            next.push(held);
                                        }
                                    }
                                } else {
                                    state.held = Some(event);
                                }
                            }
                            SyncMode::Last => {
                                if active {
                                    state.held = Some(event);
                                } else if state.last_active {
                                    if let Some(held) = state.held.take() {
                                        next.push(held);
                                    }
                                }
                            }
                        }
                    }

                    state.last_active = active;
                    batch = next;
                }
            }
        }

        batch
    }
}

fn stamp(metadata: &mut DbrMetadata, now: TimeStamp) {
    if let DbrMetadata::Time(meta) = metadata {
        meta.stamp = now;
    }
}

fn slice_indices(start: usize, stop: Option<usize>, step: usize, len: usize) -> Vec<usize> {
    let stop = stop.unwrap_or(len).min(len);
    let mut indices = Vec::new();

    let mut index = start;
    while index < stop {
        indices.push(index);
        index += step;
    }

    indices
}

/// Splits a wire PV name into the base name and its filter chain.
pub fn parse_pv_name(raw: &str) -> CaResult<(String, FilterChain)> {
    let split = match find_suffix_start(raw) {
        Some(split) => split,
        None => return Ok((raw.to_string(), FilterChain::default())),
    };

    let name = raw[..split].to_string();
    if name.is_empty() {
        return Err(DecodeError::BadFilter.into());
    }

    let mut filters = Vec::new();
    let mut rest = &raw[split..];

    while !rest.is_empty() {
        if !rest.starts_with('.') {
            return Err(DecodeError::BadFilter.into());
        }
        rest = &rest[1..];

        let end = segment_end(rest)?;
        let segment = &rest[..end];

        if segment.starts_with('[') {
            filters.push(parse_slice(&segment[1..segment.len() - 1])?);
        } else {
            parse_json_filters(segment, &mut filters)?;
        }

        rest = &rest[end..];
    }

    Ok((name, FilterChain { filters: filters.into_iter().map(|kind| (kind, FilterState::default())).collect() }))
}

// The filter suffix starts at the first ".[" or ".{"; plain dots are part of
// the PV name (record.field addressing).
fn find_suffix_start(raw: &str) -> Option<usize> {
    let bytes = raw.as_bytes();

    (0..bytes.len().saturating_sub(1))
        .find(|&i| bytes[i] == b'.' && (bytes[i + 1] == b'[' || bytes[i + 1] == b'{'))
}

// Length of one `[...]` or `{...}` segment at the head of `text`, honoring
// nesting and quoted strings inside JSON.
fn segment_end(text: &str) -> CaResult<usize> {
    let bytes = text.as_bytes();

    match bytes.first() {
        Some(b'[') => match text.find(']') {
            Some(end) => Ok(end + 1),
            None => Err(DecodeError::BadFilter.into()),
        },
        Some(b'{') => {
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;

            for (i, &byte) in bytes.iter().enumerate() {
                if in_string {
                    match byte {
                        _ if escaped => escaped = false,
                        b'\\' => escaped = true,
                        b'"' => in_string = false,
                        _ => (),
                    }
                    continue;
                }

                match byte {
                    b'"' => in_string = true,
                    b'{' => depth += 1,
                    b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            return Ok(i + 1);
                        }
                    }
                    _ => (),
                }
            }

            Err(DecodeError::BadFilter.into())
        }
        _ => Err(DecodeError::BadFilter.into()),
    }
}

fn parse_slice(body: &str) -> CaResult<FilterKind> {
    let parts: Vec<&str> = body.split(':').collect();

    let parse_part = |part: &str| -> CaResult<Option<usize>> {
        if part.is_empty() {
            return Ok(None);
        }
        part.trim().parse::<usize>().map(Some).map_err(|_| DecodeError::BadFilter.into())
    };

    Ok(match parts.len() {
        1 => {
            let index = parse_part(parts[0])?.ok_or(DecodeError::BadFilter)?;
            FilterKind::Slice { start: index, stop: Some(index + 1), step: 1 }
        }
        2 => FilterKind::Slice {
            start: parse_part(parts[0])?.unwrap_or(0),
            stop: parse_part(parts[1])?,
            step: 1,
        },
        3 => {
            let step = parse_part(parts[2])?.unwrap_or(1);
            if step == 0 {
                return Err(DecodeError::BadFilter.into());
            }
            FilterKind::Slice { start: parse_part(parts[0])?.unwrap_or(0), stop: parse_part(parts[1])?, step }
        }
        _ => return Err(DecodeError::BadFilter.into()),
    })
}

fn parse_json_filters(text: &str, filters: &mut Vec<FilterKind>) -> CaResult<()> {
    let object: Map<String, Value> = serde_json::from_str(text).map_err(|_| DecodeError::BadFilter)?;

    for (key, value) in &object {
        let filter = match key.as_str() {
            "arr" => {
                let start = json_usize(value, "s")?.unwrap_or(0);
                let stop = json_usize(value, "e")?;
                let step = json_usize(value, "i")?.unwrap_or(1);
                if step == 0 {
                    return Err(DecodeError::BadFilter.into());
                }
                FilterKind::Slice { start, stop, step }
            }
            "ts" => FilterKind::Timestamp,
            "dbnd" => {
                let abs = json_f64(value, "abs")?;
                let rel = json_f64(value, "rel")?;

                match (abs, rel) {
                    (Some(band), None) => FilterKind::DeadbandAbs(band),
                    (None, Some(band)) => FilterKind::DeadbandRel(band),
                    _ => return Err(DecodeError::BadFilter.into()),
                }
            }
            "sync" => {
                let mode = value
                    .get("m")
                    .and_then(Value::as_str)
                    .and_then(SyncMode::parse)
                    .ok_or(DecodeError::BadFilter)?;
                let state = value.get("s").and_then(Value::as_str).ok_or(DecodeError::BadFilter)?;

                FilterKind::Sync { mode, state: state.to_string() }
            }
            _ => return Err(DecodeError::BadFilter.into()),
        };

        filters.push(filter);
    }

    Ok(())
}

fn json_usize(value: &Value, key: &str) -> CaResult<Option<usize>> {
    match value.get(key) {
        None => Ok(None),
        Some(field) => match field.as_u64() {
            Some(number) => Ok(Some(number as usize)),
            None => Err(DecodeError::BadFilter.into()),
        },
    }
}

fn json_f64(value: &Value, key: &str) -> CaResult<Option<f64>> {
    match value.get(key) {
        None => Ok(None),
        Some(field) => match field.as_f64() {
            Some(number) => Ok(Some(number)),
            None => Err(DecodeError::BadFilter.into()),
        },
    }
}
