//! Ordered teardown of acquired resources

use log::debug;

type Release = Box<dyn FnOnce() + Send>;

/// Release actions run in reverse acquisition order
///
/// Pushed actions run exactly once, either from an explicit [`dispose`]
/// call or when the stack is dropped.
///
/// [`dispose`]: DisposeStack::dispose
#[derive(Default)]
pub struct DisposeStack {
    actions: Vec<(&'static str, Release)>,
}

impl DisposeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the release action for a resource that was just acquired
    pub fn push(&mut self, name: &'static str, release: impl FnOnce() + Send + 'static) {
        self.actions.push((name, Box::new(release)));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn dispose(&mut self) {
        while let Some((name, release)) = self.actions.pop() {
            debug!("Releasing {}", name);
            release();
        }
    }
}

impl Drop for DisposeStack {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for DisposeStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.actions.iter().map(|(name, _)| *name).collect();
        f.debug_struct("DisposeStack").field("actions", &names).finish()
    }
}
