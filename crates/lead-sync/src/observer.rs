use std::{
	fmt,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{Arc, PoisonError, RwLock, Weak},
};

use tracing::{debug, warn};
use uuid::Uuid;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Listeners<T> = RwLock<Vec<(Uuid, Listener<T>)>>;

/// Synchronous listener registry. Listeners run in registration order, outside of the
/// registry lock, and a panicking listener is logged and skipped without affecting the others.
pub(crate) struct Observers<T> {
	kind: &'static str,
	listeners: Arc<Listeners<T>>,
}

impl<T: 'static> Observers<T> {
	pub(crate) fn new(kind: &'static str) -> Self {
		Self {
			kind,
			listeners: Arc::default(),
		}
	}

	pub(crate) fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
		let id = Uuid::new_v4();

		self.listeners
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push((id, Arc::new(listener)));

		debug!(kind = self.kind, %id, "Listener subscribed");

		let weak = Arc::downgrade(&self.listeners);
		let kind = self.kind;

		Subscription {
			id,
			detach: Some(Box::new(move || detach(&weak, id, kind))),
		}
	}

	/// Runs every listener with `value`, returning how many of them panicked.
	pub(crate) fn notify(&self, value: &T) -> usize {
		let snapshot = self
			.listeners
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.map(|(id, listener)| (*id, Arc::clone(listener)))
			.collect::<Vec<_>>();

		snapshot
			.into_iter()
			.filter(|(id, listener)| {
				let panicked = catch_unwind(AssertUnwindSafe(|| listener(value))).is_err();
				if panicked {
					warn!(kind = self.kind, listener_id = %id, "Listener panicked, isolating it from the others");
				}
				panicked
			})
			.count()
	}

	pub(crate) fn len(&self) -> usize {
		self.listeners
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.len()
	}
}

fn detach<T>(listeners: &Weak<Listeners<T>>, id: Uuid, kind: &'static str) {
	if let Some(listeners) = listeners.upgrade() {
		listeners
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.retain(|(listener_id, _)| *listener_id != id);
		debug!(kind, %id, "Listener unsubscribed");
	}
}

/// Keeps a listener registered. Dropping it, or calling [`Subscription::unsubscribe`],
/// removes the listener, tying its lifetime to whatever surface holds the subscription.
#[must_use = "dropping a Subscription immediately unsubscribes its listener"]
pub struct Subscription {
	id: Uuid,
	detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
	#[must_use]
	pub const fn id(&self) -> Uuid {
		self.id
	}

	pub fn unsubscribe(mut self) {
		if let Some(detach) = self.detach.take() {
			detach();
		}
	}
}

impl fmt::Debug for Subscription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Subscription").field("id", &self.id).finish()
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(detach) = self.detach.take() {
			detach();
		}
	}
}
