//! Workload descriptor grammar.
//!
//! A descriptor is a comma separated list of steps; each step is a dot
//! separated list of fields. The first field selects the step type:
//!
//! ```text
//! 1.RCS.1000-2000.-1/f-2.0   submit-work: ctx.engine.duration.deps.wait
//! d.500                      delay 500us
//! p.16667                    period
//! s.-3                       sync-wait on the step three back
//! t.2 / q.4                  submit-ahead / queue-depth throttle
//! f / a.-2                   sw fence create / signal
//! P.1.-512                   context priority
//! X.1.200                    preemption period
//! M.1.VCS1|VCS2 / B.1        engine map / load balancing
//! b.1.VCS2.VCS1              bond: siblings, master
//! T.-4                       terminate unbounded step
//! S.1.1                      partition (slice mask)
//! w.1.4k/10n1m / W.2.64k     private / shared working set
//! ```
//!
//! A context id may prefix the context-free tags (`1.d.50`). A short
//! submit-work step whose engine is spelled like such a tag (`0.f.100`)
//! is read as submit-work only when the fields do not fit the tag.
//!
//! Any malformed field fails the whole descriptor with the step index.

use smallvec::SmallVec;
use std::str::FromStr;

use super::size::parse_buffer_list;
use super::step::{
    DataDep, DepTarget, DurationSpec, EngineName, FenceDep, PartitionMask, Step, StepKind,
    SubmitStep, WorkingSetDecl,
};
use crate::error::{ParseError, ParseErrorKind};

/// Number of fields in the full submit-work form.
const SUBMIT_FIELDS: usize = 5;

/// Dependency list and wait flag may be left off the end.
const MIN_SUBMIT_FIELDS: usize = 3;

/// Tags whose step carries no context id of its own.
const CONTEXT_FREE_TAGS: &[&str] = &["d", "p", "s", "t", "q", "a", "f", "T", "w", "W"];

/// Parse descriptor text into steps numbered from zero.
pub fn parse_steps(text: &str) -> Result<Vec<Step>, ParseError> {
    let mut steps = Vec::new();

    for token in text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let index = steps.len();
        let step = parse_step(index, token)?;
        log::debug!("step {}: {} {:?}", index, step.type_name(), step.kind);
        steps.push(step);
    }

    Ok(steps)
}

/// Parse a single step token.
fn parse_step(index: usize, token: &str) -> Result<Step, ParseError> {
    let fields: Vec<&str> = token.split('.').collect();
    let tag = fields[0];
    if tag.is_empty() {
        return Err(ParseError::new(index, ParseErrorKind::Empty));
    }

    let mut cursor = Fields::new(index, &fields[1..]);
    if let Some((context, kind)) = parse_tagged(index, tag, &mut cursor)? {
        cursor.finish()?;
        return Ok(Step { index, context, kind });
    }

    // "<ctx>.<tag>..." with a context-free tag. When the fields do not
    // fit the tag, the step is read as a short submit-work form instead.
    if fields.len() > 1 && fields.len() < SUBMIT_FIELDS && CONTEXT_FREE_TAGS.contains(&fields[1]) {
        if let Ok(context) = tag.parse::<u32>() {
            match parse_context_tagged(index, fields[1], &fields[2..]) {
                Ok(kind) => return Ok(Step { index, context, kind }),
                Err(tag_err) => {
                    return parse_submit_step(index, &fields).map_err(|_| tag_err);
                }
            }
        }
    }

    parse_submit_step(index, &fields)
}

fn parse_context_tagged(index: usize, tag: &str, fields: &[&str]) -> Result<StepKind, ParseError> {
    let mut cursor = Fields::new(index, fields);
    let (_, kind) = parse_tagged(index, tag, &mut cursor)?
        .ok_or_else(|| ParseError::new(index, ParseErrorKind::Trailing(tag.to_string())))?;
    cursor.finish()?;
    Ok(kind)
}

fn parse_submit_step(index: usize, fields: &[&str]) -> Result<Step, ParseError> {
    let (context, submit) = parse_submit(index, fields)?;
    Ok(Step {
        index,
        context,
        kind: StepKind::Submit(submit),
    })
}

/// Cursor over the fields following a tag.
struct Fields<'a> {
    step: usize,
    fields: &'a [&'a str],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(step: usize, fields: &'a [&'a str]) -> Self {
        Self { step, fields, pos: 0 }
    }

    fn next(&mut self, what: &'static str) -> Result<&'a str, ParseError> {
        let field = self
            .fields
            .get(self.pos)
            .ok_or_else(|| ParseError::new(self.step, ParseErrorKind::Missing(what)))?;
        self.pos += 1;
        Ok(field)
    }

    fn has_more(&self) -> bool {
        self.pos < self.fields.len()
    }

    fn int<T: FromStr>(&mut self, what: &'static str) -> Result<T, ParseError> {
        let field = self.next(what)?;
        field.parse().map_err(|_| self.invalid(what, field))
    }

    fn context(&mut self) -> Result<u32, ParseError> {
        let field = self.next("context")?;
        field
            .parse()
            .map_err(|_| ParseError::new(self.step, ParseErrorKind::Context(field.to_string())))
    }

    fn invalid(&self, what: &'static str, value: &str) -> ParseError {
        ParseError::new(
            self.step,
            ParseErrorKind::Field {
                what,
                value: value.to_string(),
            },
        )
    }

    fn finish(&self) -> Result<(), ParseError> {
        match self.fields.get(self.pos) {
            Some(extra) => Err(ParseError::new(
                self.step,
                ParseErrorKind::Trailing(extra.to_string()),
            )),
            None => Ok(()),
        }
    }
}

/// Resolve a negative relative offset against the current step index.
fn back_target(step: usize, offset: i64) -> Result<usize, ParseError> {
    let target = step as i64 + offset;
    if target < 0 {
        return Err(ParseError::new(step, ParseErrorKind::TargetUnderflow { offset }));
    }
    Ok(target as usize)
}

/// Read a strictly negative offset field and resolve it.
fn negative_target(f: &mut Fields<'_>, what: &'static str) -> Result<usize, ParseError> {
    let raw = f.fields.get(f.pos).copied().unwrap_or_default();
    let offset: i64 = f.int(what)?;
    if offset >= 0 {
        return Err(f.invalid(what, raw));
    }
    back_target(f.step, offset)
}

fn positive_u32(f: &mut Fields<'_>, what: &'static str) -> Result<u32, ParseError> {
    let raw = f.fields.get(f.pos).copied().unwrap_or_default();
    match f.int::<u32>(what)? {
        0 => Err(f.invalid(what, raw)),
        value => Ok(value),
    }
}

/// Parse a tagged step. Returns `Ok(None)` if `tag` is not a step tag.
fn parse_tagged(
    step: usize,
    tag: &str,
    f: &mut Fields<'_>,
) -> Result<Option<(u32, StepKind)>, ParseError> {
    let parsed = match tag {
        "d" => (0, StepKind::Delay { us: positive_u32(f, "delay")? }),
        "p" => (0, StepKind::Period { us: positive_u32(f, "period")? }),
        "s" => (0, StepKind::SyncWait { target: negative_target(f, "sync target")? }),
        "t" => (0, StepKind::SubmitThrottle { depth: f.int("throttle")? }),
        "q" => (0, StepKind::QueueDepthThrottle { depth: f.int("qd throttle")? }),
        "a" => (0, StepKind::FenceSignal { target: negative_target(f, "sw fence signal")? }),
        "f" => (0, StepKind::FenceCreate),
        "T" => (0, StepKind::Terminate { target: negative_target(f, "terminate target")? }),
        "P" => {
            let context = f.context()?;
            let priority = f.int("priority")?;
            (context, StepKind::Priority { priority })
        }
        "X" => {
            let context = f.context()?;
            let period_us = f.int("preemption period")?;
            (context, StepKind::Preemption { period_us })
        }
        "S" => {
            let context = f.context()?;
            let raw = f.fields.get(f.pos).copied().unwrap_or_default();
            let mask = match f.int::<i64>("partition")? {
                -1 => PartitionMask::DeviceDefault,
                value if value > 0 => PartitionMask::Slices(value as u64),
                _ => return Err(f.invalid("partition", raw)),
            };
            (context, StepKind::Partition { mask })
        }
        "M" => {
            let context = f.context()?;
            let list = f.next("engine map")?;
            let engines = parse_engine_list(list).ok_or_else(|| {
                ParseError::new(step, ParseErrorKind::EngineMap(list.to_string()))
            })?;
            (context, StepKind::EngineMap { engines })
        }
        "B" => (f.context()?, StepKind::LoadBalance),
        "b" => {
            let context = f.context()?;
            let list = f.next("bond siblings")?;
            let siblings = parse_engine_list(list).ok_or_else(|| {
                ParseError::new(step, ParseErrorKind::BondSiblings(list.to_string()))
            })?;
            let field = f.next("bond master")?;
            let master = EngineName::parse(field)
                .filter(|e| !e.is_default())
                .ok_or_else(|| ParseError::new(step, ParseErrorKind::Engine(field.to_string())))?;
            (context, StepKind::Bond { siblings, master })
        }
        "w" | "W" => {
            let id = f.int("working set id")?;
            let mut sizes = Vec::new();
            loop {
                let list = f.next("working set buffers")?;
                if !parse_buffer_list(list, &mut sizes) {
                    return Err(ParseError::new(step, ParseErrorKind::BufferSize(list.to_string())));
                }
                if !f.has_more() {
                    break;
                }
            }
            let shared = tag == "W";
            (0, StepKind::WorkingSet(WorkingSetDecl { id, shared, sizes }))
        }
        _ => return Ok(None),
    };

    Ok(Some(parsed))
}

/// `|` separated engine list without `DEFAULT`.
fn parse_engine_list(text: &str) -> Option<Vec<EngineName>> {
    text.split('|')
        .map(|name| EngineName::parse(name).filter(|e| !e.is_default()))
        .collect()
}

/// Parse the submit-work form `ctx.engine.duration[.deps[.wait]]`.
fn parse_submit(step: usize, fields: &[&str]) -> Result<(u32, SubmitStep), ParseError> {
    let err = |kind| ParseError::new(step, kind);

    let context = fields[0]
        .parse::<u32>()
        .map_err(|_| err(ParseErrorKind::Context(fields[0].to_string())))?;

    if !(MIN_SUBMIT_FIELDS..=SUBMIT_FIELDS).contains(&fields.len()) {
        return Err(err(ParseErrorKind::FieldCount(fields.len())));
    }

    let engine = EngineName::parse(fields[1])
        .ok_or_else(|| err(ParseErrorKind::Engine(fields[1].to_string())))?;
    let duration = parse_duration(step, fields[2])?;
    let (data_deps, fence_dep) = parse_dependencies(step, fields.get(3).copied().unwrap_or("0"))?;
    let wait = match fields.get(4).copied().unwrap_or("0") {
        "0" => false,
        "1" => true,
        other => return Err(err(ParseErrorKind::WaitFlag(other.to_string()))),
    };

    Ok((
        context,
        SubmitStep {
            engine,
            duration,
            data_deps,
            fence_dep,
            wait,
            emit_fence: false,
            preempt_us: 0,
        },
    ))
}

/// `N`, `min-max` (max > min) or `*`.
fn parse_duration(step: usize, text: &str) -> Result<DurationSpec, ParseError> {
    if text == "*" {
        return Ok(DurationSpec::Unbounded);
    }

    let err = |kind| ParseError::new(step, kind);
    let (min_text, max_text) = match text.split_once('-') {
        Some((min, max)) => (min, Some(max)),
        None => (text, None),
    };

    let min = min_text
        .parse::<u32>()
        .ok()
        .filter(|&v| v > 0)
        .ok_or_else(|| err(ParseErrorKind::Duration(text.to_string())))?;

    match max_text {
        None => Ok(DurationSpec::Fixed(min)),
        Some(max_text) => {
            let max = max_text
                .parse::<u32>()
                .ok()
                .filter(|&v| v > min)
                .ok_or_else(|| err(ParseErrorKind::DurationRange(text.to_string())))?;
            Ok(DurationSpec::Range { min, max })
        }
    }
}

type ParsedDeps = (SmallVec<[DataDep; 4]>, Option<FenceDep>);

/// Parse a `/` separated dependency list; `0` means none.
fn parse_dependencies(step: usize, text: &str) -> Result<ParsedDeps, ParseError> {
    let mut data = SmallVec::new();
    let mut fence = None;

    if text == "0" {
        return Ok((data, fence));
    }

    for entry in text.split('/') {
        let bad = || ParseError::new(step, ParseErrorKind::Dependency(entry.to_string()));
        let mut chars = entry.chars();

        match chars.next() {
            Some('-') => {
                if !chars.next().is_some_and(|c| c.is_ascii_digit()) {
                    return Err(bad());
                }
                let offset: i64 = entry.parse().map_err(|_| bad())?;
                if offset >= 0 {
                    return Err(bad());
                }
                data.push(DataDep {
                    target: DepTarget::Step(back_target(step, offset)?),
                    write: false,
                });
            }
            Some(kind @ ('s' | 'f')) => {
                if fence.is_some() {
                    return Err(ParseError::new(step, ParseErrorKind::MultipleFences));
                }
                let offset: i64 = entry[1..].parse().map_err(|_| bad())?;
                if offset >= 0 {
                    return Err(bad());
                }
                fence = Some(FenceDep {
                    target: back_target(step, offset)?,
                    submit: kind == 's',
                });
            }
            Some(kind @ ('r' | 'w')) => {
                let (set, slots) = entry[1..].split_once('-').ok_or_else(bad)?;
                let set: u32 = set.parse().map_err(|_| bad())?;
                let write = kind == 'w';
                let (first, last) = match slots.split_once('-') {
                    Some((from, to)) => {
                        let from: usize = from.parse().map_err(|_| bad())?;
                        let to: usize = to.parse().map_err(|_| bad())?;
                        if to <= from {
                            return Err(bad());
                        }
                        (from, to)
                    }
                    None => {
                        let slot: usize = slots.parse().map_err(|_| bad())?;
                        (slot, slot)
                    }
                };
                for slot in first..=last {
                    data.push(DataDep {
                        target: DepTarget::Buffer { set, slot },
                        write,
                    });
                }
            }
            _ => return Err(bad()),
        }
    }

    Ok((data, fence))
}
