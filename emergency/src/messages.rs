use crate::helpers::{pack_string_list, unpack_string_list, E_INVALID_PARAMETER};
use windows::{core::*, Win32::Foundation::*};

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum LogonType {
    Interactive = 2,
    Network = 3,
    Batch = 4,
    Service = 5,
    NetworkCleartext = 8,
    NewCredentials = 9,
}

impl TryFrom<u32> for LogonType {
    type Error = Error;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            2 => Ok(LogonType::Interactive),
            3 => Ok(LogonType::Network),
            4 => Ok(LogonType::Batch),
            5 => Ok(LogonType::Service),
            8 => Ok(LogonType::NetworkCleartext),
            9 => Ok(LogonType::NewCredentials),
            _ => Err(ERROR_INVALID_PARAMETER.into()),
        }
    }
}

impl From<LogonType> for u32 {
    fn from(value: LogonType) -> Self {
        value as u32
    }
}

/// Whose identity the new process gets.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Credential {
    /// Log on `DOMAIN\user` (or plain `user`) with a password.
    Logon {
        user_name: String,
        password: String,
        logon_type: LogonType,
    },
    /// Duplicate the primary token of an existing process.
    ProcessToken { process_id: u32 },
}

impl Credential {
    pub fn local_system() -> Self {
        Credential::Logon {
            user_name: "NT AUTHORITY\\SYSTEM".to_owned(),
            password: String::new(),
            logon_type: LogonType::Service,
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct RunAsRequest {
    pub target_executable: String,
    pub command_line: String,
    pub current_directory: Option<String>,
    pub credential: Credential,
    pub session_id: u32,
    /// Fully qualified, `WinSta\Desktop`.
    pub desktop_name: String,
    pub use_linked_token: bool,
}

const CREDENTIAL_LOGON: &str = "logon";
const CREDENTIAL_TOKEN: &str = "token";

const TAG_EXECUTE: &str = "execute";
const TAG_INVOKE: &str = "invoke";

// Fields before the credential-specific tail:
// executable, command line, current dir, session, desktop, linked, credential kind
const REQUEST_HEAD_FIELDS: usize = 7;

impl RunAsRequest {
    pub fn validate(&self) -> Result<()> {
        let credential_ok = match &self.credential {
            Credential::Logon { user_name, .. } => !user_name.is_empty(),
            Credential::ProcessToken { process_id } => *process_id != 0,
        };
        if self.target_executable.is_empty() || self.desktop_name.is_empty() || !credential_ok {
            return Err(E_INVALID_PARAMETER.into());
        }
        Ok(())
    }

    fn push_fields(&self, fields: &mut Vec<String>) {
        fields.extend([
            self.target_executable.clone(),
            self.command_line.clone(),
            self.current_directory.clone().unwrap_or_default(),
            self.session_id.to_string(),
            self.desktop_name.clone(),
            u8::from(self.use_linked_token).to_string(),
        ]);
        match &self.credential {
            Credential::Logon {
                user_name,
                password,
                logon_type,
            } => fields.extend([
                CREDENTIAL_LOGON.to_owned(),
                user_name.clone(),
                password.clone(),
                u32::from(*logon_type).to_string(),
            ]),
            Credential::ProcessToken { process_id } => {
                fields.extend([CREDENTIAL_TOKEN.to_owned(), process_id.to_string()])
            }
        }
    }

    /// The inverse of `push_fields`. The field count has to match the
    /// credential kind exactly: a message that carries a logon user *and* a
    /// token source is refused rather than guessed at.
    fn from_fields(fields: &[String]) -> Result<Self> {
        if fields.len() < REQUEST_HEAD_FIELDS {
            return Err(E_INVALID_PARAMETER.into());
        }
        let (head, tail) = fields.split_at(REQUEST_HEAD_FIELDS);
        let credential = match (head[6].as_str(), tail) {
            (CREDENTIAL_LOGON, [user_name, password, logon_type]) => Credential::Logon {
                user_name: user_name.clone(),
                password: password.clone(),
                logon_type: parse_u32(logon_type)?.try_into()?,
            },
            (CREDENTIAL_TOKEN, [process_id]) => Credential::ProcessToken {
                process_id: parse_u32(process_id)?,
            },
            _ => return Err(E_INVALID_PARAMETER.into()),
        };

        let request = RunAsRequest {
            target_executable: head[0].clone(),
            command_line: head[1].clone(),
            current_directory: Some(head[2].clone()).filter(|dir| !dir.is_empty()),
            session_id: parse_u32(&head[3])?,
            desktop_name: head[4].clone(),
            use_linked_token: match head[5].as_str() {
                "0" => false,
                "1" => true,
                _ => return Err(E_INVALID_PARAMETER.into()),
            },
            credential,
        };
        request.validate()?;
        Ok(request)
    }
}

fn parse_u32(s: &str) -> Result<u32> {
    s.parse().map_err(|_| E_INVALID_PARAMETER.into())
}

/// What travels over a broker channel.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum BrokerMessage {
    /// To the elevated broker: register and start the run-as service
    /// `service_name`, then have it run `request`.
    ExecuteRunAs {
        service_name: String,
        request: RunAsRequest,
    },
    /// To the run-as service itself: create the process.
    InvokeRunAs(RunAsRequest),
}

impl BrokerMessage {
    #[cfg(test)]
    pub fn request(&self) -> &RunAsRequest {
        match self {
            BrokerMessage::ExecuteRunAs { request, .. } => request,
            BrokerMessage::InvokeRunAs(request) => request,
        }
    }

    pub fn encode(&self) -> String {
        let mut fields = Vec::with_capacity(REQUEST_HEAD_FIELDS + 6);
        match self {
            BrokerMessage::ExecuteRunAs {
                service_name,
                request,
            } => {
                fields.push(TAG_EXECUTE.to_owned());
                fields.push(service_name.clone());
                request.push_fields(&mut fields);
            }
            BrokerMessage::InvokeRunAs(request) => {
                fields.push(TAG_INVOKE.to_owned());
                request.push_fields(&mut fields);
            }
        }
        pack_string_list(&fields)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        let fields = unpack_string_list(payload);
        match fields.split_first() {
            Some((tag, rest)) if tag == TAG_EXECUTE => match rest.split_first() {
                Some((service_name, request)) if !service_name.is_empty() => {
                    Ok(BrokerMessage::ExecuteRunAs {
                        service_name: service_name.clone(),
                        request: RunAsRequest::from_fields(request)?,
                    })
                }
                _ => Err(E_INVALID_PARAMETER.into()),
            },
            Some((tag, rest)) if tag == TAG_INVOKE => {
                Ok(BrokerMessage::InvokeRunAs(RunAsRequest::from_fields(rest)?))
            }
            _ => Err(E_INVALID_PARAMETER.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system_request() -> RunAsRequest {
        RunAsRequest {
            target_executable: r"C:\Tools\emergency.exe".to_owned(),
            command_line: r#""C:\Tools\emergency.exe" --switch Emergency --new-instance"#
                .to_owned(),
            current_directory: None,
            credential: Credential::local_system(),
            session_id: 1,
            desktop_name: "WinSTA0\\Emergency".to_owned(),
            use_linked_token: false,
        }
    }

    #[test]
    fn test_logon_type_conversions() {
        assert_eq!(LogonType::try_from(5), Ok(LogonType::Service));
        assert_eq!(LogonType::try_from(9), Ok(LogonType::NewCredentials));
        assert_eq!(LogonType::try_from(6), Err(ERROR_INVALID_PARAMETER.into()));
        assert_eq!(u32::from(LogonType::Interactive), 2);
    }

    #[test]
    fn test_validate() {
        assert!(system_request().validate().is_ok());

        let mut req = system_request();
        req.target_executable.clear();
        assert_eq!(req.validate(), Err(E_INVALID_PARAMETER.into()));

        let mut req = system_request();
        req.desktop_name.clear();
        assert!(req.validate().is_err());

        let mut req = system_request();
        req.credential = Credential::ProcessToken { process_id: 0 };
        assert!(req.validate().is_err());

        let mut req = system_request();
        req.credential = Credential::Logon {
            user_name: String::new(),
            password: "hunter2".to_owned(),
            logon_type: LogonType::Interactive,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_message_layout() {
        let msg = BrokerMessage::InvokeRunAs(system_request());
        assert_eq!(
            msg.encode(),
            "invoke\0C:\\Tools\\emergency.exe\0\"C:\\Tools\\emergency.exe\" --switch Emergency --new-instance\0\0\
             1\0WinSTA0\\Emergency\00\0logon\0NT AUTHORITY\\SYSTEM\0\05\0"
        );
        assert_eq!(BrokerMessage::decode(&msg.encode()).unwrap(), msg);

        let mut req = system_request();
        req.credential = Credential::ProcessToken { process_id: 4242 };
        req.use_linked_token = true;
        req.current_directory = Some(r"C:\Windows".to_owned());
        let msg = BrokerMessage::ExecuteRunAs {
            service_name: "EmergencyDeskAbCdEfGh12345678".to_owned(),
            request: req,
        };
        assert_eq!(BrokerMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_mixed_credentials() {
        // A token request that also smuggles a logon user and password.
        let fields = [
            "invoke",
            r"C:\Tools\emergency.exe",
            "",
            "",
            "1",
            "WinSTA0\\Emergency",
            "0",
            "token",
            "4242",
            "Administrator",
            "hunter2",
        ];
        assert_eq!(
            BrokerMessage::decode(&pack_string_list(&fields)),
            Err(E_INVALID_PARAMETER.into())
        );

        // Unknown credential kind
        let fields = [
            "invoke",
            r"C:\Tools\emergency.exe",
            "",
            "",
            "1",
            "WinSTA0\\Emergency",
            "0",
            "both",
            "4242",
        ];
        assert!(BrokerMessage::decode(&pack_string_list(&fields)).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(BrokerMessage::decode("").is_err());
        assert!(BrokerMessage::decode("shutdown\0").is_err());
        assert!(BrokerMessage::decode("invoke\0").is_err());
        // execute with an empty service name
        let mut fields = vec!["execute".to_owned(), String::new()];
        system_request().push_fields(&mut fields);
        assert!(BrokerMessage::decode(&pack_string_list(&fields)).is_err());
        // session id that isn't a number
        let mut fields = vec!["invoke".to_owned()];
        system_request().push_fields(&mut fields);
        fields[4] = "one".to_owned();
        assert!(BrokerMessage::decode(&pack_string_list(&fields)).is_err());
    }
}
