use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Name of the save-set the GUI reads and writes when none is given.
pub const DEFAULT_SAVE_SET: &str = "rustogramer_gui";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DefinitionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(
        "condition `{condition}` depends on `{dependency}`, which resolved to {matches} definitions"
    )]
    DependencyNotFound { condition: String, dependency: String, matches: usize },
    #[error("cyclic condition dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
    #[error("condition `{condition}` needs exactly {expected} parameter(s), found {found}")]
    ParameterCount { condition: String, expected: usize, found: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(alias = "id")]
    pub number: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(default, alias = "hi", skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bins: Option<i64>,
    #[serde(
        default,
        deserialize_with = "empty_string_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub units: Option<String>,
}

impl ParameterDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, number: i64) -> Self {
        Self { name: name.into(), number, low: None, high: None, bins: None, units: None }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AxisDefinition {
    pub low: f64,
    pub high: f64,
    pub bins: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpectrumDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub spectrum_type: String,
    #[serde(alias = "chantype")]
    pub datatype: String,
    /// Axes in definition order: the first is X, the second (if any) is Y.
    #[serde(default)]
    pub axes: Vec<AxisDefinition>,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub xparameters: Vec<String>,
    #[serde(default)]
    pub yparameters: Vec<String>,
}

impl SpectrumDefinition {
    #[must_use]
    pub fn x_axis(&self) -> Option<&AxisDefinition> {
        self.axes.first()
    }

    #[must_use]
    pub fn y_axis(&self) -> Option<&AxisDefinition> {
        self.axes.get(1)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum MaskComparison {
    Equal,
    And,
    Not,
}

impl MaskComparison {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "em",
            Self::And => "am",
            Self::Not => "nm",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "em" => Some(Self::Equal),
            "am" => Some(Self::And),
            "nm" => Some(Self::Not),
            _ => None,
        }
    }
}

/// Per-type shape of a condition. Type tags follow the server's gate types.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionKind {
    True,
    False,
    And { components: Vec<String> },
    Or { components: Vec<String> },
    Not { component: String },
    Slice { parameter: String, low: f64, high: f64 },
    GammaSlice { parameters: Vec<String>, low: f64, high: f64 },
    Contour { x_parameter: String, y_parameter: String, points: Vec<Point> },
    Band { x_parameter: String, y_parameter: String, points: Vec<Point> },
    GammaContour { parameters: Vec<String>, points: Vec<Point> },
    GammaBand { parameters: Vec<String>, points: Vec<Point> },
    Mask { comparison: MaskComparison, parameter: String, mask: i64 },
    Other {
        type_tag: String,
        parameters: Vec<String>,
        points: Vec<Point>,
        dependencies: Vec<String>,
        low: Option<f64>,
        high: Option<f64>,
        mask: Option<i64>,
    },
}

impl ConditionKind {
    #[must_use]
    pub fn type_tag(&self) -> &str {
        match self {
            Self::True => "T",
            Self::False => "F",
            Self::And { .. } => "*",
            Self::Or { .. } => "+",
            Self::Not { .. } => "-",
            Self::Slice { .. } => "s",
            Self::GammaSlice { .. } => "gs",
            Self::Contour { .. } => "c",
            Self::Band { .. } => "b",
            Self::GammaContour { .. } => "gc",
            Self::GammaBand { .. } => "gb",
            Self::Mask { comparison, .. } => comparison.as_str(),
            Self::Other { type_tag, .. } => type_tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCondition", into = "RawCondition")]
pub struct ConditionDefinition {
    pub name: String,
    pub kind: ConditionKind,
}

impl ConditionDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ConditionKind) -> Self {
        Self { name: name.into(), kind }
    }

    /// Keep a record as [`ConditionKind::Other`] under its own type tag,
    /// without checking the shape its tag calls for.
    #[must_use]
    pub fn untyped(raw: RawCondition) -> Self {
        let RawCondition { name, type_tag, points, parameters, dependencies, low, high, mask } =
            raw;
        Self {
            name,
            kind: ConditionKind::Other { type_tag, parameters, points, dependencies, low, high, mask },
        }
    }

    #[must_use]
    pub fn type_tag(&self) -> &str {
        self.kind.type_tag()
    }

    /// Names of the conditions this one is built from.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        match &self.kind {
            ConditionKind::And { components } | ConditionKind::Or { components } => components,
            ConditionKind::Not { component } => std::slice::from_ref(component),
            ConditionKind::Other { dependencies, .. } => dependencies,
            _ => &[],
        }
    }

    #[must_use]
    pub fn parameters(&self) -> Vec<&str> {
        match &self.kind {
            ConditionKind::Slice { parameter, .. } | ConditionKind::Mask { parameter, .. } => {
                vec![parameter.as_str()]
            }
            ConditionKind::Contour { x_parameter, y_parameter, .. }
            | ConditionKind::Band { x_parameter, y_parameter, .. } => {
                vec![x_parameter.as_str(), y_parameter.as_str()]
            }
            ConditionKind::GammaSlice { parameters, .. }
            | ConditionKind::GammaContour { parameters, .. }
            | ConditionKind::GammaBand { parameters, .. }
            | ConditionKind::Other { parameters, .. } => {
                parameters.iter().map(String::as_str).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Points as persisted. Ranges are stored as `(low, 0), (high, 0)`.
    #[must_use]
    pub fn points(&self) -> Cow<'_, [Point]> {
        match &self.kind {
            ConditionKind::Slice { low, high, .. } | ConditionKind::GammaSlice { low, high, .. } => {
                Cow::Owned(range_points(*low, *high))
            }
            ConditionKind::Other { points, low: Some(low), high: Some(high), .. }
                if points.is_empty() =>
            {
                Cow::Owned(range_points(*low, *high))
            }
            ConditionKind::Contour { points, .. }
            | ConditionKind::Band { points, .. }
            | ConditionKind::GammaContour { points, .. }
            | ConditionKind::GammaBand { points, .. }
            | ConditionKind::Other { points, .. } => Cow::Borrowed(points),
            _ => Cow::Borrowed(&[]),
        }
    }

    #[must_use]
    pub fn mask(&self) -> Option<i64> {
        match &self.kind {
            ConditionKind::Mask { mask, .. } => Some(*mask),
            ConditionKind::Other { mask, .. } => *mask,
            _ => None,
        }
    }
}

/// Untyped condition record as exchanged with the histogram server's REST
/// interface and as reassembled from stored rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawCondition {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub points: Vec<Point>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
    #[serde(default, rename = "gates", alias = "dependencies", skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(default, rename = "value", alias = "mask", skip_serializing_if = "Option::is_none")]
    pub mask: Option<i64>,
}

impl TryFrom<RawCondition> for ConditionDefinition {
    type Error = DefinitionError;

    fn try_from(raw: RawCondition) -> Result<Self, Self::Error> {
        let RawCondition { name, type_tag, points, parameters, dependencies, low, high, mask } =
            raw;

        let kind = match type_tag.as_str() {
            "T" => ConditionKind::True,
            "F" => ConditionKind::False,
            "*" => ConditionKind::And { components: dependencies },
            "+" => ConditionKind::Or { components: dependencies },
            "-" => {
                let component = single_component(&name, dependencies)?;
                ConditionKind::Not { component }
            }
            "s" => {
                let (low, high) = slice_limits(&name, low, high, &points)?;
                let [parameter] = exact_parameters::<1>(&name, parameters)?;
                ConditionKind::Slice { parameter, low, high }
            }
            "gs" => {
                let (low, high) = slice_limits(&name, low, high, &points)?;
                ConditionKind::GammaSlice { parameters, low, high }
            }
            "c" => {
                let [x_parameter, y_parameter] = exact_parameters::<2>(&name, parameters)?;
                ConditionKind::Contour { x_parameter, y_parameter, points }
            }
            "b" => {
                let [x_parameter, y_parameter] = exact_parameters::<2>(&name, parameters)?;
                ConditionKind::Band { x_parameter, y_parameter, points }
            }
            "gc" => ConditionKind::GammaContour { parameters, points },
            "gb" => ConditionKind::GammaBand { parameters, points },
            tag => match MaskComparison::parse(tag) {
                Some(comparison) => {
                    let [parameter] = exact_parameters::<1>(&name, parameters)?;
                    let mask = mask.ok_or_else(|| {
                        DefinitionError::Validation(format!(
                            "mask condition `{name}` has no mask value"
                        ))
                    })?;
                    ConditionKind::Mask { comparison, parameter, mask }
                }
                None => ConditionKind::Other {
                    type_tag: tag.to_string(),
                    parameters,
                    points,
                    dependencies,
                    low,
                    high,
                    mask,
                },
            },
        };

        Ok(Self { name, kind })
    }
}

impl From<ConditionDefinition> for RawCondition {
    fn from(definition: ConditionDefinition) -> Self {
        let type_tag = definition.type_tag().to_string();
        let mut raw = RawCondition { name: definition.name, type_tag, ..RawCondition::default() };

        match definition.kind {
            ConditionKind::True | ConditionKind::False => {}
            ConditionKind::And { components } | ConditionKind::Or { components } => {
                raw.dependencies = components;
            }
            ConditionKind::Not { component } => raw.dependencies = vec![component],
            ConditionKind::Slice { parameter, low, high } => {
                raw.parameters = vec![parameter];
                raw.low = Some(low);
                raw.high = Some(high);
            }
            ConditionKind::GammaSlice { parameters, low, high } => {
                raw.parameters = parameters;
                raw.low = Some(low);
                raw.high = Some(high);
            }
            ConditionKind::Contour { x_parameter, y_parameter, points }
            | ConditionKind::Band { x_parameter, y_parameter, points } => {
                raw.parameters = vec![x_parameter, y_parameter];
                raw.points = points;
            }
            ConditionKind::GammaContour { parameters, points }
            | ConditionKind::GammaBand { parameters, points } => {
                raw.parameters = parameters;
                raw.points = points;
            }
            ConditionKind::Mask { parameter, mask, .. } => {
                raw.parameters = vec![parameter];
                raw.mask = Some(mask);
            }
            ConditionKind::Other { parameters, points, dependencies, low, high, mask, .. } => {
                raw.parameters = parameters;
                raw.points = points;
                raw.dependencies = dependencies;
                raw.low = low;
                raw.high = high;
                raw.mask = mask;
            }
        }

        raw
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GateApplication {
    pub spectrum: String,
    #[serde(default)]
    pub gate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreeVariable {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub units: String,
}

/// Everything one save operation writes and one load reconstructs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DefinitionSnapshot {
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
    #[serde(default)]
    pub spectra: Vec<SpectrumDefinition>,
    #[serde(default)]
    pub conditions: Vec<ConditionDefinition>,
    #[serde(default)]
    pub applications: Vec<GateApplication>,
    #[serde(default)]
    pub variables: Vec<TreeVariable>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    Visiting,
    Written,
}

/// Order conditions so that every condition follows all of its dependencies.
///
/// Roots are visited in input order and dependencies in listed order, so an
/// input that is already dependency-safe comes back unchanged. A name shared by
/// several definitions resolves to the first of them.
///
/// # Errors
/// Returns [`DefinitionError::DependencyNotFound`] when a dependency names no
/// definition in `definitions`, and [`DefinitionError::CyclicDependency`] when
/// the dependency graph has a cycle (a condition naming itself included).
pub fn order_conditions(
    definitions: &[ConditionDefinition],
) -> Result<Vec<&ConditionDefinition>, DefinitionError> {
    let mut index_by_name: BTreeMap<&str, usize> = BTreeMap::new();
    for (index, definition) in definitions.iter().enumerate() {
        index_by_name.entry(definition.name.as_str()).or_insert(index);
    }

    let mut states = vec![VisitState::Unvisited; definitions.len()];
    let mut ordered = Vec::with_capacity(definitions.len());
    // (definition index, position of the next dependency to visit)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..definitions.len() {
        if states[root] != VisitState::Unvisited {
            continue;
        }
        states[root] = VisitState::Visiting;
        stack.push((root, 0));

        while let Some(&(current, next)) = stack.last() {
            let Some(dependency) = definitions[current].dependencies().get(next) else {
                stack.pop();
                states[current] = VisitState::Written;
                ordered.push(&definitions[current]);
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            let Some(&target) = index_by_name.get(dependency.as_str()) else {
                return Err(DefinitionError::DependencyNotFound {
                    condition: definitions[current].name.clone(),
                    dependency: dependency.clone(),
                    matches: 0,
                });
            };

            match states[target] {
                VisitState::Written => {}
                VisitState::Visiting => return Err(cycle_error(definitions, &stack, target)),
                VisitState::Unvisited => {
                    states[target] = VisitState::Visiting;
                    stack.push((target, 0));
                }
            }
        }
    }

    Ok(ordered)
}

fn cycle_error(
    definitions: &[ConditionDefinition],
    stack: &[(usize, usize)],
    target: usize,
) -> DefinitionError {
    let start = stack.iter().position(|&(index, _)| index == target).unwrap_or(0);
    let mut cycle = stack[start..]
        .iter()
        .map(|&(index, _)| definitions[index].name.clone())
        .collect::<Vec<_>>();
    cycle.push(definitions[target].name.clone());
    DefinitionError::CyclicDependency { cycle }
}

fn single_component(condition: &str, dependencies: Vec<String>) -> Result<String, DefinitionError> {
    let found = dependencies.len();
    let [component]: [String; 1] = dependencies.try_into().map_err(|_| {
        DefinitionError::Validation(format!(
            "condition `{condition}` needs exactly 1 component, found {found}"
        ))
    })?;
    Ok(component)
}

fn exact_parameters<const N: usize>(
    condition: &str,
    parameters: Vec<String>,
) -> Result<[String; N], DefinitionError> {
    parameters.try_into().map_err(|parameters: Vec<String>| DefinitionError::ParameterCount {
        condition: condition.to_string(),
        expected: N,
        found: parameters.len(),
    })
}

fn range_points(low: f64, high: f64) -> Vec<Point> {
    vec![Point { x: low, y: 0.0 }, Point { x: high, y: 0.0 }]
}

fn slice_limits(
    condition: &str,
    low: Option<f64>,
    high: Option<f64>,
    points: &[Point],
) -> Result<(f64, f64), DefinitionError> {
    if let (Some(low), Some(high)) = (low, high) {
        return Ok((low, high));
    }

    match points {
        [low, high] => Ok((low.x, high.x)),
        _ => Err(DefinitionError::Validation(format!(
            "slice condition `{condition}` needs low/high or exactly two limit points, found {} points",
            points.len()
        ))),
    }
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|text| !text.is_empty()))
}
