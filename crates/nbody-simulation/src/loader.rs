//! Reading initial body state from files

use crate::error::Result;
use std::path::Path;

/// Body state read from a file
#[derive(Debug, Clone, PartialEq)]
pub struct BodyData<T> {
    /// `4 * body_count` scalars, `w` is the mass
    pub positions: Vec<T>,
    /// `4 * body_count` scalars
    pub velocities: Vec<T>,
    pub ids: Vec<i32>,
    pub body_count: usize,
}

/// Source of body state for [`crate::BodySystem::load_state`].
///
/// Implemented for closures so callers can plug in any format reader.
pub trait BodyFileReader<T> {
    fn read(&self, path: &Path) -> Result<BodyData<T>>;
}

impl<T, F> BodyFileReader<T> for F
where
    F: Fn(&Path) -> Result<BodyData<T>>,
{
    fn read(&self, path: &Path) -> Result<BodyData<T>> {
        self(path)
    }
}
