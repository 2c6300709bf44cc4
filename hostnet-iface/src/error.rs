use thiserror::Error;

use crate::kernel::KernelError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{op} {link}{}: {source}", vid_suffix(.vid))]
    Kernel {
        op: &'static str,
        link: String,
        vid: Option<u16>,
        #[source]
        source: KernelError,
    },

    #[error("{0} exists but is not a bridge")]
    NotABridge(String),

    #[error("{0} has no hardware address")]
    MissingHardwareAddr(String),

    #[error("{0} has more than one address, not support multiple addresses")]
    MultipleAddresses(String),

    #[error("physical nic vlan network: no nic attached to bridge {0}")]
    NicNotAttached(String),

    #[error("vlan network on bridge {0} hasn't attached a nic")]
    RepealWithoutNic(String),
}

fn vid_suffix(vid: &Option<u16>) -> String {
    vid.map(|v| format!(" vid {v}")).unwrap_or_default()
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn kernel(op: &'static str, link: &str) -> impl FnOnce(KernelError) -> Error {
        let link = link.to_string();
        move |source| Error::Kernel {
            op,
            link,
            vid: None,
            source,
        }
    }

    pub(crate) fn kernel_vlan(
        op: &'static str,
        link: &str,
        vid: u16,
    ) -> impl FnOnce(KernelError) -> Error {
        let link = link.to_string();
        move |source| Error::Kernel {
            op,
            link,
            vid: Some(vid),
            source,
        }
    }

    /// Errors that need operator attention rather than another attempt.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::NotABridge(_)
                | Error::MultipleAddresses(_)
                | Error::NicNotAttached(_)
                | Error::RepealWithoutNic(_)
        )
    }
}
