use crate::dependency::ConstraintKind;
use crate::input::{ConfItem, ConfType};
use rand::Rng;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Default half-width of the integer perturbation window.
const DEFAULT_INT_SPAN: i64 = 1024;
/// Ports handed out by reassignment stay clear of the privileged range.
const PORT_RANGE: std::ops::RangeInclusive<u16> = 1024..=65535;
/// Regeneration attempts before a `distinct` constraint is declared unsatisfiable.
const MAX_CONSTRAINT_ATTEMPTS: usize = 32;
const SEGMENT_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Errors raised when no legal value can be produced. These are data-model
/// errors: they abort the current mutation round.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("No enum domain known for parameter '{0}'")]
    NoEnumDomain(String),

    #[error("Value '{value}' of '{name}' is not numeric, cannot apply '{kind}'")]
    NotNumeric {
        name: String,
        value: String,
        kind: ConstraintKind,
    },

    #[error("Cannot make '{dependent}' satisfy '{kind}' relative to '{source_name}'='{source_value}'")]
    Unsatisfiable {
        kind: ConstraintKind,
        dependent: String,
        source_name: String,
        source_value: String,
    },
}

/// A number with an optional unit suffix, e.g. `30s`, `128m`, `-5`, `0.75`.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub magnitude: f64,
    pub unit: String,
    pub integral: bool,
}

impl Quantity {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let split = raw
            .char_indices()
            .find(|(index, c)| !(c.is_ascii_digit() || *c == '.' || (*index == 0 && *c == '-')))
            .map(|(index, _)| index)
            .unwrap_or(raw.len());
        let (number, unit) = raw.split_at(split);
        let unit = unit.trim();
        if !unit.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        let magnitude: f64 = number.parse().ok()?;
        if !magnitude.is_finite() {
            return None;
        }
        Some(Self {
            magnitude,
            unit: unit.to_string(),
            integral: !number.contains('.'),
        })
    }

    fn with_magnitude(&self, magnitude: f64) -> Self {
        Self {
            magnitude,
            unit: self.unit.clone(),
            integral: self.integral,
        }
    }

    pub fn render(&self) -> String {
        if self.integral {
            format!("{}{}", self.magnitude.round() as i64, self.unit)
        } else {
            format!("{}{}", self.magnitude, self.unit)
        }
    }
}

/// Produces new, type-correct values for configuration items and adjusts
/// dependent items so that declared constraints keep holding.
#[derive(Debug, Clone)]
pub struct ValueGenerator {
    enum_domains: HashMap<String, Vec<String>>,
    int_span: i64,
}

impl Default for ValueGenerator {
    fn default() -> Self {
        Self {
            enum_domains: HashMap::new(),
            int_span: DEFAULT_INT_SPAN,
        }
    }
}

impl ValueGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_int_span(mut self, span: i64) -> Self {
        self.int_span = span.max(1);
        self
    }

    pub fn with_enum_domain(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.enum_domains.insert(name.into(), values);
        self
    }

    pub fn enum_domain(&self, name: &str) -> Option<&[String]> {
        self.enum_domains.get(name).map(Vec::as_slice)
    }

    /// Generates a new value for `item` according to its declared type.
    ///
    /// The result differs from the current value whenever the type's domain
    /// holds more than one element.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        item: &ConfItem,
        rng: &mut R,
    ) -> Result<String, ValueError> {
        let current = item.value.trim();
        let value = match item.ty {
            ConfType::Bool => match current.to_ascii_lowercase().as_str() {
                "true" => "false".to_string(),
                "false" => "true".to_string(),
                _ => rng.random_bool(0.5).to_string(),
            },
            ConfType::Int => match current.parse::<i64>() {
                Ok(v) => perturb_int(v, self.int_span, rng).to_string(),
                Err(_) => rng.random_range(0..=self.int_span).to_string(),
            },
            ConfType::Float => match current.parse::<f64>() {
                Ok(v) if v.is_finite() => {
                    let span = self.int_span as f64;
                    let mut next = v + rng.random_range(-span..span);
                    if next == v {
                        // Large magnitudes absorb the offset; step by a few ulps instead.
                        let step = (v.abs() * f64::EPSILON * 2.0).max(1.0);
                        next = if (v + step).is_finite() { v + step } else { v - step };
                    }
                    next.to_string()
                }
                _ => rng.random_range(0.0..1.0f64).to_string(),
            },
            ConfType::Port => {
                let old = current.parse::<u16>().ok();
                loop {
                    let port = rng.random_range(PORT_RANGE);
                    if Some(port) != old {
                        break port.to_string();
                    }
                }
            }
            ConfType::Ip => match current.parse::<Ipv4Addr>() {
                Ok(addr) => {
                    let [a, b, c, d] = addr.octets();
                    let mut last = rng.random_range(1..=254u8);
                    if last == d {
                        last = if d == 254 { 1 } else { d + 1 };
                    }
                    Ipv4Addr::new(a, b, c, last).to_string()
                }
                Err(_) => format!("127.0.0.{}", rng.random_range(1..=254u8)),
            },
            ConfType::String => mutate_string(current, rng),
            ConfType::DirPath | ConfType::FilePath => mutate_path(current, rng),
            ConfType::Enum => {
                let domain = self
                    .enum_domains
                    .get(&item.name)
                    .filter(|values| !values.is_empty())
                    .ok_or_else(|| ValueError::NoEnumDomain(item.name.clone()))?;
                match domain.iter().position(|v| v == current) {
                    Some(index) => domain[(index + 1) % domain.len()].clone(),
                    None => domain[0].clone(),
                }
            }
            ConfType::Time | ConfType::Size => match Quantity::parse(current) {
                Some(q) => perturb_quantity(&q, self.int_span, rng).render(),
                None => rng.random_range(1..=self.int_span).to_string(),
            },
        };
        Ok(value)
    }

    /// Adjusts `dependent` in place so that `kind` holds relative to `source`.
    ///
    /// Fails when the relation cannot be established; the dependent is left
    /// untouched in that case.
    pub fn apply_constraint<R: Rng + ?Sized>(
        &self,
        kind: ConstraintKind,
        source: &ConfItem,
        dependent: &mut ConfItem,
        rng: &mut R,
    ) -> Result<(), ValueError> {
        let unsatisfiable = || ValueError::Unsatisfiable {
            kind,
            dependent: dependent.name.clone(),
            source_name: source.name.clone(),
            source_value: source.value.clone(),
        };

        let candidate = match kind {
            ConstraintKind::Distinct => {
                let mut trial = dependent.clone();
                let mut found = None;
                for _ in 0..MAX_CONSTRAINT_ATTEMPTS {
                    trial.value = self.generate(&trial, rng)?;
                    if kind.holds(&source.value, &trial.value) {
                        found = Some(trial.value.clone());
                        break;
                    }
                }
                found.ok_or_else(unsatisfiable)?
            }
            ConstraintKind::SubPath => {
                let parent = source.value.trim().trim_end_matches('/');
                if source.value.trim().is_empty() {
                    return Err(unsatisfiable());
                }
                let leaf = dependent
                    .value
                    .trim()
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .filter(|segment| !segment.is_empty() && !segment.contains(':'))
                    .map(str::to_string)
                    .unwrap_or_else(|| random_segment(rng, 8));
                format!("{parent}/{leaf}")
            }
            ConstraintKind::Greater | ConstraintKind::Less => {
                let not_numeric = |item: &ConfItem| ValueError::NotNumeric {
                    name: item.name.clone(),
                    value: item.value.clone(),
                    kind,
                };
                let base = Quantity::parse(&source.value).ok_or_else(|| not_numeric(source))?;
                let shape = match dependent.ty {
                    ConfType::Int | ConfType::Port | ConfType::Float => {
                        if !base.unit.is_empty() {
                            return Err(unsatisfiable());
                        }
                        Quantity {
                            magnitude: 0.0,
                            unit: String::new(),
                            integral: dependent.ty != ConfType::Float,
                        }
                    }
                    ConfType::Time | ConfType::Size => {
                        let own = Quantity::parse(&dependent.value);
                        let unit = match &own {
                            Some(q) if base.unit.is_empty() || q.unit == base.unit => q.unit.clone(),
                            _ => base.unit.clone(),
                        };
                        Quantity {
                            magnitude: 0.0,
                            unit,
                            integral: own.map_or(base.integral, |q| q.integral),
                        }
                    }
                    _ => return Err(not_numeric(dependent)),
                };
                let (min, max) = numeric_bounds(dependent.ty);
                let delta = rng.random_range(1..=self.int_span) as f64;
                let mut magnitude = if kind == ConstraintKind::Greater {
                    base.magnitude + delta
                } else {
                    base.magnitude - delta
                };
                if shape.integral {
                    // Rounding towards the source keeps the relation strict.
                    magnitude = if kind == ConstraintKind::Greater {
                        magnitude.floor()
                    } else {
                        magnitude.ceil()
                    };
                }
                shape.with_magnitude(magnitude.clamp(min, max)).render()
            }
        };

        if !kind.holds(&source.value, &candidate) {
            return Err(unsatisfiable());
        }
        dependent.value = candidate;
        Ok(())
    }
}

fn numeric_bounds(ty: ConfType) -> (f64, f64) {
    match ty {
        ConfType::Port => (1.0, 65535.0),
        ConfType::Time | ConfType::Size => (0.0, i64::MAX as f64),
        _ => (i64::MIN as f64, i64::MAX as f64),
    }
}

fn perturb_int<R: Rng + ?Sized>(value: i64, span: i64, rng: &mut R) -> i64 {
    let mut delta = rng.random_range(-span..=span);
    if delta == 0 {
        delta = 1;
    }
    value.checked_add(delta).unwrap_or(value - delta)
}

fn perturb_quantity<R: Rng + ?Sized>(q: &Quantity, span: i64, rng: &mut R) -> Quantity {
    let delta = rng.random_range(1..=span) as f64;
    let magnitude = if rng.random_bool(0.5) && q.magnitude - delta >= 0.0 {
        q.magnitude - delta
    } else {
        q.magnitude + delta
    };
    q.with_magnitude(magnitude)
}

fn random_segment<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| SEGMENT_ALPHABET[rng.random_range(0..SEGMENT_ALPHABET.len())] as char)
        .collect()
}

fn mutate_string<R: Rng + ?Sized>(current: &str, rng: &mut R) -> String {
    let mut chars: Vec<char> = current.chars().collect();
    if chars.is_empty() {
        let len = rng.random_range(1..=8);
        return random_segment(rng, len);
    }
    let index = rng.random_range(0..chars.len());
    match rng.random_range(0..3u8) {
        0 => {
            let old = chars[index];
            let mut replacement = old;
            while replacement == old {
                replacement = SEGMENT_ALPHABET[rng.random_range(0..SEGMENT_ALPHABET.len())] as char;
            }
            chars[index] = replacement;
        }
        1 => {
            let inserted = SEGMENT_ALPHABET[rng.random_range(0..SEGMENT_ALPHABET.len())] as char;
            chars.insert(index, inserted);
        }
        _ if chars.len() > 1 => {
            chars.remove(index);
        }
        _ => chars.push('x'),
    }
    chars.into_iter().collect()
}

/// Splits `scheme://authority` off a path-like value so that mutation only
/// touches the path part.
fn split_authority(value: &str) -> (&str, &str) {
    match value.find("://") {
        Some(pos) => {
            let after = pos + 3;
            match value[after..].find('/') {
                Some(slash) => value.split_at(after + slash),
                None => (value, ""),
            }
        }
        None => ("", value),
    }
}

fn mutate_path<R: Rng + ?Sized>(current: &str, rng: &mut R) -> String {
    if current.is_empty() {
        return format!("/tmp/{}", random_segment(rng, 8));
    }
    let (head, path) = split_authority(current);
    let trimmed = path.trim_end_matches('/');
    if !trimmed.is_empty() && rng.random_bool(0.5) {
        let (parent, last) = match trimmed.rfind('/') {
            Some(index) => trimmed.split_at(index + 1),
            None => ("", trimmed),
        };
        if !last.is_empty() {
            let mut segment = random_segment(rng, 8);
            while segment == last {
                segment = random_segment(rng, 8);
            }
            return format!("{head}{parent}{segment}");
        }
    }
    format!("{head}{trimmed}/{}", random_segment(rng, 8))
}
