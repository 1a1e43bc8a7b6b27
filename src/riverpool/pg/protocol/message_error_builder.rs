use crate::riverpool::pg::protocol::{Tag, MessageBuilder, ErrorSeverity, ErrorFieldTag, Message, ProtocolVersion};

/// Builds an ErrorResponse or NoticeResponse, depending on the severity.
/// Under V2 the fields collapse into a single "SEVERITY:  message" string.
pub struct MessageErrorBuilder {
    severity: ErrorSeverity,
    code: String,
    msg: String,
    fields: Vec<(ErrorFieldTag, String)>,
}

impl MessageErrorBuilder {
    pub fn new(severity: ErrorSeverity, code: &str, msg: &str) -> Self {
        MessageErrorBuilder {
            severity,
            code: code.to_string(),
            msg: msg.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn write_field(&mut self, field: ErrorFieldTag, s: &str) -> &mut Self {
        self.fields.push((field, s.to_string()));
        self
    }

    pub fn detail(&mut self, s: &str) -> &mut Self {
        self.write_field(ErrorFieldTag::MESSAGE_DETAIL, s)
    }

    pub fn hint(&mut self, s: &str) -> &mut Self {
        self.write_field(ErrorFieldTag::MESSAGE_HINT, s)
    }

    pub fn location(&mut self, file: &str, line: u32) -> &mut Self {
        self.write_field(ErrorFieldTag::FILE, file);
        self.write_field(ErrorFieldTag::LINE, &line.to_string())
    }

    fn tag(&self) -> Tag {
        if self.severity >= ErrorSeverity::Error {
            Tag::ERROR_RESPONSE
        } else {
            Tag::NOTICE_RESPONSE
        }
    }

    pub fn finish(&self, version: ProtocolVersion) -> Message {
        let mut mb = MessageBuilder::new(self.tag());
        if version.is_legacy() {
            mb.write_str(&format!("{}:  {}\n", self.severity.as_str(), self.msg));
            return mb.finish();
        }
        let severity = self.severity.as_str();
        for (field, value) in [
            (ErrorFieldTag::LOCALIZED_SEVERITY, severity),
            (ErrorFieldTag::SEVERITY, severity),
            (ErrorFieldTag::CODE, self.code.as_str()),
            (ErrorFieldTag::MESSAGE, self.msg.as_str()),
        ] {
            mb.write_byte(field.as_u8());
            mb.write_str(value);
        }
        for (field, value) in &self.fields {
            mb.write_byte(field.as_u8());
            mb.write_str(value);
        }
        mb.write_byte(ErrorFieldTag::NULL_TERMINATOR.as_u8());
        mb.finish()
    }
}
