strong_type!(
    /// Rank of a process in the benchmark group, `0..size`.
    PeerId,
    u32
);
strong_type!(
    /// Identifier carried by a work request and echoed by its completion.
    WorkId,
    u64
);

impl WorkId {
    /// Return this id and advance `self` to the next one.
    pub fn take_next(&mut self) -> WorkId {
        let id = *self;
        self.0 = self.0.wrapping_add(1);
        id
    }
}
