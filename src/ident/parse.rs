/// ParseIdError is returned when parsing any of the textual ID forms fails.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("'{input}' is not a valid {kind}")]
pub struct ParseIdError {
    kind: &'static str,
    input: String,
}

impl ParseIdError {
    pub(super) fn new(kind: &'static str, input: impl Into<String>) -> Self {
        ParseIdError {
            kind,
            input: input.into(),
        }
    }
}
