/// Asserts that an owner performed its explicit teardown before dropping.
/// Armed on creation, disarmed by [`DropGuard::disarm`]; dropping while
/// armed panics in debug builds and logs in release.
#[derive(Debug)]
pub struct DropGuard {
    what: &'static str,
    armed: bool,
}
impl DropGuard {
    pub fn new(what: &'static str) -> Self {
        Self { what, armed: true }
    }

    pub fn disarm(mut self) {
        assert!(self.armed, "{}: disarmed twice", self.what);
        self.armed = false;
    }
}
impl Drop for DropGuard {
    fn drop(&mut self) {
        if self.armed {
            debug_assert!(false, "{}: dropped while armed", self.what);
            log::error!("{}: dropped while armed", self.what);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DropGuard;

    #[test]
    fn disarmed_drop_passes() {
        let guard = DropGuard::new("test");
        guard.disarm();
    }

    #[test]
    #[should_panic(expected = "dropped while armed")]
    fn armed_drop_panics() {
        let _guard = DropGuard::new("test");
    }
}
