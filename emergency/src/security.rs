use crate::desktop::{open_desktop, open_window_station};
use crate::helpers::{get_sid_for_process, OwnedLocalAlloc};
use crate::tracing::trace_log_message;
use std::mem::size_of;
use std::ptr::null_mut;
use windows::Win32::Foundation::{GENERIC_ALL, HANDLE, PSID};
use windows::Win32::Storage::FileSystem::WRITE_DAC;
use windows::Win32::System::StationsAndDesktops::{DESKTOP_READOBJECTS, DESKTOP_WRITEOBJECTS};
use windows::{
    core::*, Win32::Security::Authorization::*, Win32::Security::*, Win32::System::Memory::*,
    Win32::System::SystemServices::*, Win32::System::Threading::*,
};

// windows-rs doesn't have a definition for this macro.
const SECURITY_MAX_SID_SIZE: usize = 88;

/// Only SYSTEM and the Administrators group may open the run-as service's pipe.
const SERVICE_PIPE_SDDL: &str = "D:P(A;;GA;;;SY)(A;;GA;;;BA)";

struct WellKnownSid([u8; SECURITY_MAX_SID_SIZE]);

impl WellKnownSid {
    fn new(kind: WELL_KNOWN_SID_TYPE) -> Result<Self> {
        let mut sid = WellKnownSid([0u8; SECURITY_MAX_SID_SIZE]);
        let mut sid_len = sid.0.len() as u32;
        unsafe { CreateWellKnownSid(kind, None, sid.psid(), &mut sid_len)? };
        Ok(sid)
    }

    fn psid(&mut self) -> PSID {
        PSID(self.0.as_mut_ptr() as _)
    }
}

// MSDN regarding SetSecurityDescriptorDacl:
// > The DACL is referenced by, not copied into, the security descriptor.
// --> To hand out a SD we need to hold onto everything we allocated.
#[derive(Default)]
pub struct OwnedSecurityDescriptor {
    pub sd: SECURITY_DESCRIPTOR,
    sacl: OwnedLocalAlloc<*mut ACL>,
    dacl: OwnedLocalAlloc<*mut ACL>,
}

impl OwnedSecurityDescriptor {
    pub fn as_psd(&self) -> PSECURITY_DESCRIPTOR {
        PSECURITY_DESCRIPTOR(&self.sd as *const _ as _)
    }
}

fn allow_generic_all(trustee: PSID, trustee_type: TRUSTEE_TYPE) -> EXPLICIT_ACCESS_W {
    EXPLICIT_ACCESS_W {
        grfAccessPermissions: GENERIC_ALL.0,
        grfAccessMode: SET_ACCESS,
        grfInheritance: NO_INHERITANCE,
        Trustee: TRUSTEE_W {
            pMultipleTrustee: null_mut(),
            MultipleTrusteeOperation: NO_MULTIPLE_TRUSTEE,
            TrusteeForm: TRUSTEE_IS_SID,
            TrusteeType: trustee_type,
            ptstrName: PWSTR(trustee.0 as _),
        },
    }
}

/// Creates a descriptor of form
///   D:(A;;GA;;;WD)(A;;GA;;;AC)
/// The All Application Packages entry is only added where the OS knows that
/// SID (Windows 8 and later); CreateWellKnownSid fails for it elsewhere.
pub fn create_permissive_security_descriptor() -> Result<OwnedSecurityDescriptor> {
    let mut everyone = WellKnownSid::new(WinWorldSid)?;
    let mut all_packages = WellKnownSid::new(WinBuiltinAnyPackageSid).ok();

    let mut entries = vec![allow_generic_all(
        everyone.psid(),
        TRUSTEE_IS_WELL_KNOWN_GROUP,
    )];
    if let Some(sid) = all_packages.as_mut() {
        entries.push(allow_generic_all(sid.psid(), TRUSTEE_IS_WELL_KNOWN_GROUP));
    }

    unsafe {
        let mut s: OwnedSecurityDescriptor = Default::default();
        let psd = PSECURITY_DESCRIPTOR(&mut s.sd as *mut _ as _);
        InitializeSecurityDescriptor(psd, SECURITY_DESCRIPTOR_REVISION)?;
        // SetEntriesInAclW copies the SIDs into the new ACL, so the stack
        // buffers above don't need to outlive this function.
        SetEntriesInAclW(Some(&entries), None, &mut *s.dacl).ok()?;
        SetSecurityDescriptorDacl(psd, true, Some(*s.dacl), false)?;
        Ok(s)
    }
}

fn set_dacl(object: HANDLE, descriptor: &OwnedSecurityDescriptor) -> Result<()> {
    let info = DACL_SECURITY_INFORMATION;
    unsafe { SetUserObjectSecurity(object, &info, descriptor.as_psd()) }
}

/// Opens up `window_station` and `desktop` so a process running as another
/// user, in another logon session, can draw on the desktop and get input.
///
/// Both objects are attempted even if the first one fails; the first error
/// is what we return. Applying the same DACL again changes nothing.
pub fn harden_window_station_and_desktop(window_station: &str, desktop: &str) -> Result<()> {
    let descriptor = create_permissive_security_descriptor()?;
    if let Ok(sddl) = sd_to_string(descriptor.as_psd()) {
        trace_log_message(&format!(
            "applying {sddl} to {window_station}\\{desktop}"
        ));
    }

    let station_result = open_window_station(window_station, WRITE_DAC.0)
        .and_then(|station| set_dacl(HANDLE(station.0 .0 as _), &descriptor));

    let desktop_result = open_desktop(
        desktop,
        WRITE_DAC.0 | DESKTOP_READOBJECTS.0 | DESKTOP_WRITEOBJECTS.0,
    )
    .and_then(|desk| set_dacl(HANDLE(desk.0 .0 as _), &descriptor));

    station_result.and(desktop_result)
}

/// Creates a descriptor of form
///   D:(A;;GA;;;<pid's sid>)S:(ML;;NWNRNX;;;ME)
/// for the elevated broker's pipe: only the user who started it may connect,
/// and the medium integrity label lets that user's unelevated processes in.
pub fn create_security_descriptor_for_process(pid: u32) -> Result<OwnedSecurityDescriptor> {
    unsafe {
        let mut s: OwnedSecurityDescriptor = Default::default();
        let psd = PSECURITY_DESCRIPTOR(&mut s.sd as *mut _ as _);
        InitializeSecurityDescriptor(psd, SECURITY_DESCRIPTOR_REVISION)?;

        // DACL
        {
            let user = {
                let process =
                    Owned::new(OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid)?);
                get_sid_for_process(*process)?
            };

            let ea = [allow_generic_all(
                PSID(&user.Sid as *const _ as _),
                TRUSTEE_IS_USER,
            )];

            SetEntriesInAclW(Some(&ea), None, &mut *s.dacl).ok()?;
            SetSecurityDescriptorDacl(psd, true, Some(*s.dacl), false)?;
        }

        // SACL
        {
            let mut label = WellKnownSid::new(WinMediumLabelSid)?;
            let sid = label.psid();
            let sid_len = GetLengthSid(sid);

            const SACL_BUFFER_PREFIX_LEN: usize =
                size_of::<ACL>() + size_of::<SYSTEM_MANDATORY_LABEL_ACE>();
            let sacl_len = SACL_BUFFER_PREFIX_LEN as u32 + sid_len;
            s.sacl.0 = LocalAlloc(LMEM_FIXED, sacl_len as usize)?.0 as _;

            InitializeAcl(*s.sacl, sacl_len, ACL_REVISION)?;
            AddMandatoryAce(
                *s.sacl,
                ACL_REVISION,
                ACE_FLAGS(0),
                SYSTEM_MANDATORY_LABEL_NO_READ_UP
                    | SYSTEM_MANDATORY_LABEL_NO_WRITE_UP
                    | SYSTEM_MANDATORY_LABEL_NO_EXECUTE_UP,
                sid,
            )?;

            SetSecurityDescriptorSacl(psd, true, Some(*s.sacl), false)?;
        }

        Ok(s)
    }
}

/// The run-as service's pipe descriptor. LocalFree'd on drop.
pub fn create_service_pipe_security_descriptor() -> Result<OwnedLocalAlloc<PSECURITY_DESCRIPTOR>>
{
    let mut sd: OwnedLocalAlloc<PSECURITY_DESCRIPTOR> = Default::default();
    unsafe {
        ConvertStringSecurityDescriptorToSecurityDescriptorW(
            &HSTRING::from(SERVICE_PIPE_SDDL),
            SDDL_REVISION_1,
            &mut *sd,
            None,
        )?;
    }
    Ok(sd)
}

/// Renders the parts of a descriptor we care about as SDDL. Handy for tests
/// and for tracing what we're about to apply.
pub fn sd_to_string(sd: PSECURITY_DESCRIPTOR) -> Result<String> {
    unsafe {
        let mut buffer: OwnedLocalAlloc<PWSTR> = Default::default();
        ConvertSecurityDescriptorToStringSecurityDescriptorW(
            sd,
            SDDL_REVISION,
            DACL_SECURITY_INFORMATION | LABEL_SECURITY_INFORMATION,
            &mut *buffer,
            None,
        )?;
        Ok(buffer.to_string()?)
    }
}
