//! Typed field names for AMI messages.

/// Error returned when parsing an unrecognized field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseHeaderError(pub String);

impl std::fmt::Display for ParseHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown AMI header: {}", self.0)
    }
}

impl std::error::Error for ParseHeaderError {}

define_wire_enum! {
    error_type: ParseHeaderError,
    /// Field names used by the engine when reading events and responses.
    ///
    /// Use with [`ProtocolMessage::get()`](crate::ProtocolMessage::get) for
    /// type-safe lookups. Names not listed here can still be read with a
    /// plain `&str`.
    pub enum AmiHeader {
        Action => "Action",
        ActionId => "ActionID",
        Event => "Event",
        Response => "Response",
        Message => "Message",
        EventList => "EventList",
        ListItems => "ListItems",
        Privilege => "Privilege",
        Output => "Output",
        Channel => "Channel",
        Uniqueid => "Uniqueid",
        Linkedid => "Linkedid",
        CallerIdNum => "CallerIDNum",
        CallerIdName => "CallerIDName",
        ConnectedLineNum => "ConnectedLineNum",
        ConnectedLineName => "ConnectedLineName",
        Context => "Context",
        Exten => "Exten",
        Priority => "Priority",
        ChannelState => "ChannelState",
        ChannelStateDesc => "ChannelStateDesc",
        Cause => "Cause",
        CauseTxt => "Cause-txt",
        BridgeUniqueid => "BridgeUniqueid",
        Application => "Application",
        ApplicationData => "ApplicationData",
        Duration => "Duration",
        Queue => "Queue",
        MemberName => "MemberName",
        Interface => "Interface",
        Status => "Status",
        Paused => "Paused",
        Position => "Position",
        Username => "Username",
        Secret => "Secret",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_wire_casing() {
        assert_eq!(AmiHeader::ActionId.to_string(), "ActionID");
        assert_eq!(AmiHeader::CauseTxt.to_string(), "Cause-txt");
        assert_eq!(AmiHeader::CallerIdNum.to_string(), "CallerIDNum");
    }

    #[test]
    fn as_ref_str() {
        let h: &str = AmiHeader::Uniqueid.as_ref();
        assert_eq!(h, "Uniqueid");
    }

    #[test]
    fn from_str_case_insensitive() {
        assert_eq!("actionid".parse::<AmiHeader>(), Ok(AmiHeader::ActionId));
        assert_eq!("ACTIONID".parse::<AmiHeader>(), Ok(AmiHeader::ActionId));
        assert_eq!("UniqueID".parse::<AmiHeader>(), Ok(AmiHeader::Uniqueid));
        assert!(AmiHeader::CauseTxt.matches("cause-TXT"));
    }

    #[test]
    fn from_str_unknown() {
        let err = "X-Not-A-Field".parse::<AmiHeader>();
        assert_eq!(
            err.unwrap_err()
                .to_string(),
            "unknown AMI header: X-Not-A-Field"
        );
    }

    #[test]
    fn every_variant_parses_back() {
        for v in AmiHeader::ALL {
            let wire = v.to_string();
            let parsed: AmiHeader = wire
                .parse()
                .unwrap();
            assert_eq!(parsed, *v, "round-trip failed for {wire}");
        }
    }
}
