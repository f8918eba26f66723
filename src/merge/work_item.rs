use std::fmt;

use crate::error::Result;

/// One unit of merge work, such as merging one attribute field or the
/// deletion maps.
///
/// Items write their output through the merge file system; the scheduler
/// publishes it once the worker that ran the item exits cleanly.
pub trait MergeWorkItem: Send {
    fn name(&self) -> &str;

    /// Estimated peak memory in bytes.
    fn required_resource(&self) -> u64;

    fn process(&mut self) -> Result<()>;
}

impl fmt::Debug for dyn MergeWorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeWorkItem")
            .field("name", &self.name())
            .field("required_resource", &self.required_resource())
            .finish()
    }
}

/// A work item backed by a closure.
pub struct FnWorkItem<F> {
    name: String,
    required_resource: u64,
    work: F,
}

impl<F> FnWorkItem<F>
where
    F: FnMut() -> Result<()> + Send,
{
    pub fn new(name: impl Into<String>, required_resource: u64, work: F) -> Self {
        FnWorkItem {
            name: name.into(),
            required_resource,
            work,
        }
    }

    pub fn boxed(name: impl Into<String>, required_resource: u64, work: F) -> Box<dyn MergeWorkItem>
    where
        F: 'static,
    {
        Box::new(FnWorkItem::new(name, required_resource, work))
    }
}

impl<F> MergeWorkItem for FnWorkItem<F>
where
    F: FnMut() -> Result<()> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn required_resource(&self) -> u64 {
        self.required_resource
    }

    fn process(&mut self) -> Result<()> {
        (self.work)()
    }
}
