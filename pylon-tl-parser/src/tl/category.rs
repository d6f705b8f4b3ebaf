/// Whether a [`super::Definition`] is a constructor or an RPC function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Category {
    /// Section before `---functions---` (or after `---types---`).
    #[default]
    Types,
    /// Section after `---functions---`.
    Functions,
}
