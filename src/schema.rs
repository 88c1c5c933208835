/// How a single feature is constrained.
#[derive(Debug, Clone, Copy)]
pub enum FeatureKind {
    Categorical(&'static [&'static str]),
    /// Integral value within `[min, max]`.
    Integer { min: i64, max: i64 },
    /// Integral or real value. `max` caps the whole part of the value; `None`
    /// means unbounded above.
    Numeric { min: f64, max: Option<f64> },
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureSpec {
    pub name: &'static str,
    pub kind: FeatureKind,
}

pub const SEX: &[&str] = &["Male", "Female"];

pub const RACE: &[&str] = &[
    "White",
    "Black",
    "Asian-Pac-Islander",
    "Amer-Indian-Eskimo",
    "Other",
];

pub const WORKCLASS: &[&str] = &[
    "Private",
    "Self-emp-not-inc",
    "Local-gov",
    "?",
    "State-gov",
    "Self-emp-inc",
    "Federal-gov",
    "Without-pay",
    "Never-worked",
];

pub const EDUCATION: &[&str] = &[
    "HS-grad",
    "Some-college",
    "Bachelors",
    "Masters",
    "Assoc-voc",
    "11th",
    "Assoc-acdm",
    "10th",
    "7th-8th",
    "Prof-school",
    "9th",
    "12th",
    "Doctorate",
    "5th-6th",
    "1st-4th",
    "Preschool",
];

pub const MARITAL_STATUS: &[&str] = &[
    "Married-civ-spouse",
    "Never-married",
    "Divorced",
    "Separated",
    "Widowed",
    "Married-spouse-absent",
    "Married-AF-spouse",
];

/// The nine required features, in the order their values are checked.
/// Categorical domains come first, then the numeric ranges.
pub const FEATURES: &[FeatureSpec] = &[
    FeatureSpec {
        name: "sex",
        kind: FeatureKind::Categorical(SEX),
    },
    FeatureSpec {
        name: "race",
        kind: FeatureKind::Categorical(RACE),
    },
    FeatureSpec {
        name: "workclass",
        kind: FeatureKind::Categorical(WORKCLASS),
    },
    FeatureSpec {
        name: "education",
        kind: FeatureKind::Categorical(EDUCATION),
    },
    FeatureSpec {
        name: "marital-status",
        kind: FeatureKind::Categorical(MARITAL_STATUS),
    },
    FeatureSpec {
        name: "age",
        kind: FeatureKind::Integer { min: 0, max: 200 },
    },
    FeatureSpec {
        name: "hours-per-week",
        kind: FeatureKind::Numeric {
            min: 0.0,
            max: Some(168.0),
        },
    },
    FeatureSpec {
        name: "capital-gain",
        kind: FeatureKind::Numeric { min: 0.0, max: None },
    },
    FeatureSpec {
        name: "capital-loss",
        kind: FeatureKind::Numeric { min: 0.0, max: None },
    },
];

pub fn feature(name: &str) -> Option<&'static FeatureSpec> {
    FEATURES.iter().find(|spec| spec.name == name)
}

pub fn is_feature(name: &str) -> bool {
    feature(name).is_some()
}
