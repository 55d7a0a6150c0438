//! XML namespace constants used by this crate.

/// `http://etherx.jabber.org/streams`
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// `jabber:server`, the default namespace of S2S stanzas.
pub const JABBER_SERVER: &str = "jabber:server";

/// `jabber:server:dialback`, XEP-0220.
pub const DIALBACK: &str = "jabber:server:dialback";

/// `urn:xmpp:features:dialback`, the stream-feature advertisement form
/// of XEP-0220 (as opposed to the legacy `jabber:server:dialback`
/// feature element some peers still send).
pub const DIALBACK_FEATURE: &str = "urn:xmpp:features:dialback";

/// `urn:ietf:params:xml:ns:xmpp-tls`
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// `urn:ietf:params:xml:ns:xmpp-streams`, stream-level error conditions.
pub const STREAM_ERROR: &str = "urn:ietf:params:xml:ns:xmpp-streams";
