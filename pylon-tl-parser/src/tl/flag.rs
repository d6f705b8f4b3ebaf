/// The `flags.N` part of a conditional parameter such as `flags.3?string`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Flag {
    /// Name of the `#` field carrying the bit.
    pub name: String,
    /// Bit index, 0 to 31.
    pub index: u32,
}
