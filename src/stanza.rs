//! Owned stanza/verify payloads queued on a `Route`.

use minidom::Element;

/// A stanza (`<message/>`, `<presence/>`, `<iq/>`) queued for delivery
/// on a `Route`.
///
/// Unlike the original C++ implementation, which parses into a
/// `rapidxml` arena and must explicitly deep-copy (`freeze()`) a
/// stanza out of that arena before it can outlive the read buffer,
/// `xso`/`minidom` parsing already hands back a fully owned `Element`
/// tree. `freeze()` is kept here as a named operation — queuing code
/// calls it the same places the original calls `freeze()` — but it is
/// just `Clone`.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    element: Element,
}

impl Stanza {
    /// Wrap an already-parsed element as a queued stanza.
    pub fn new(element: Element) -> Self {
        Stanza { element }
    }

    /// Deep-copy this stanza so it can be queued past the lifetime of
    /// whatever read buffer produced it. A no-op in the sense that the
    /// `Element` is already owned, but named to match the places the
    /// original dialback/router code calls `freeze()` before queuing.
    pub fn freeze(&self) -> Stanza {
        self.clone()
    }

    /// Borrow the underlying element.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Consume this stanza, returning the underlying element.
    pub fn into_element(self) -> Element {
        self.element
    }
}

impl From<Element> for Stanza {
    fn from(element: Element) -> Self {
        Stanza::new(element)
    }
}

/// A dialback `db:verify` request queued until the verify round-trip
/// completes, per `examples/original_source/src/router.cc`'s
/// `check_verify`/`m_dialback` queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Verify {
    pub id: String,
    pub to: String,
    pub from: String,
    pub key: String,
}

impl Verify {
    /// Deep-copy, matching `Stanza::freeze` (see there for why this
    /// is trivial in this implementation).
    pub fn freeze(&self) -> Verify {
        self.clone()
    }
}
