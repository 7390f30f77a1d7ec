/// The second argument of a `publish` command
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum PublishMode {
    /// `live`, nothing is kept
    Live,

    /// `record`, replaces any existing recording
    Record,

    /// `append`, extends an existing recording
    Append,
}
