//! Elevated process watch via WMI instance events.
//!
//! Subscribes to `__InstanceCreationEvent`/`__InstanceDeletionEvent` for
//! `Win32_Process` through `ExecNotificationQuery`. Requires administrator
//! privileges; the registry falls back to snapshot polling otherwise.
//!
//! All COM objects live and die on the registry's watch thread; the struct
//! itself only carries configuration.

use crate::error::RegistryError;
use crate::inject::CancellationToken;
use crate::registry::watch::{ProcessWatch, WatchEvent};
use windows::core::{Interface, BSTR, PCWSTR};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoSetProxyBlanket, CoUninitialize, CLSCTX_INPROC_SERVER,
    COINIT_MULTITHREADED, EOAC_NONE, RPC_C_AUTHN_LEVEL_CALL, RPC_C_IMP_LEVEL_IMPERSONATE,
};
use windows::Win32::System::Rpc::{RPC_C_AUTHN_WINNT, RPC_C_AUTHZ_NONE};
use windows::Win32::System::Variant::{
    VariantClear, VARIANT, VT_BSTR, VT_I4, VT_UI4, VT_UNKNOWN,
};
use windows::Win32::System::Wmi::{
    IWbemClassObject, IWbemLocator, IWbemServices, WbemLocator, WBEM_FLAG_FORWARD_ONLY,
    WBEM_FLAG_RETURN_IMMEDIATELY, WBEM_S_TIMEDOUT,
};

const NOTIFICATION_QUERY: &str =
    "SELECT * FROM __InstanceOperationEvent WITHIN 1 WHERE TargetInstance ISA 'Win32_Process'";

/// How long one `Next` call blocks before re-checking the stop token (ms).
const NEXT_TIMEOUT_MS: i32 = 500;

/// Elevated strategy: OS-level process start/stop notifications.
pub struct WmiProcessWatch;

impl WmiProcessWatch {
    pub fn new() -> Self {
        Self
    }

    fn connect(&self) -> Result<IWbemServices, RegistryError> {
        unsafe {
            let locator: IWbemLocator =
                CoCreateInstance(&WbemLocator, None, CLSCTX_INPROC_SERVER)
                    .map_err(RegistryError::WmiConnectFailed)?;

            let services = locator
                .ConnectServer(
                    &BSTR::from("ROOT\\CIMV2"),
                    &BSTR::new(),
                    &BSTR::new(),
                    &BSTR::new(),
                    0,
                    &BSTR::new(),
                    None,
                )
                .map_err(RegistryError::WmiConnectFailed)?;

            CoSetProxyBlanket(
                &services,
                RPC_C_AUTHN_WINNT,
                RPC_C_AUTHZ_NONE,
                PCWSTR::null(),
                RPC_C_AUTHN_LEVEL_CALL,
                RPC_C_IMP_LEVEL_IMPERSONATE,
                None,
                EOAC_NONE,
            )
            .map_err(RegistryError::WmiConnectFailed)?;

            Ok(services)
        }
    }
}

impl Default for WmiProcessWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessWatch for WmiProcessWatch {
    fn name(&self) -> &'static str {
        "wmi-events"
    }

    fn run(
        &mut self,
        emit: &mut dyn FnMut(WatchEvent),
        stop: &CancellationToken,
    ) -> Result<(), RegistryError> {
        unsafe {
            CoInitializeEx(None, COINIT_MULTITHREADED)
                .ok()
                .map_err(RegistryError::WmiConnectFailed)?;
        }
        let _com = ComGuard;

        let services = self.connect()?;

        let enumerator = unsafe {
            services
                .ExecNotificationQuery(
                    &BSTR::from("WQL"),
                    &BSTR::from(NOTIFICATION_QUERY),
                    WBEM_FLAG_RETURN_IMMEDIATELY.0 | WBEM_FLAG_FORWARD_ONLY.0,
                    None,
                )
                .map_err(RegistryError::WmiQueryFailed)?
        };

        log::info!("WMI process notifications subscribed");

        while !stop.is_cancelled() {
            let mut objects: [Option<IWbemClassObject>; 1] = [None];
            let mut returned = 0u32;

            let hr = unsafe { enumerator.Next(NEXT_TIMEOUT_MS, &mut objects, &mut returned) };

            if hr.0 == WBEM_S_TIMEDOUT.0 {
                continue;
            }
            if hr.is_err() {
                return Err(RegistryError::WmiQueryFailed(hr.into()));
            }
            if returned == 0 {
                continue;
            }

            let Some(event) = objects[0].take() else {
                continue;
            };

            match unsafe { parse_instance_event(&event) } {
                Some(watch_event) => emit(watch_event),
                None => log::debug!("Ignoring unparsable WMI instance event"),
            }
        }

        Ok(())
    }
}

/// Extracts Started/Stopped(pid) from an `__InstanceOperationEvent`.
unsafe fn parse_instance_event(event: &IWbemClassObject) -> Option<WatchEvent> {
    let class = get_string_property(event, windows::core::w!("__CLASS"))?;

    let mut variant = VARIANT::default();
    event
        .Get(
            windows::core::w!("TargetInstance"),
            0,
            &mut variant,
            None,
            None,
        )
        .ok()?;

    let target = variant_to_object(&variant);
    let _ = VariantClear(&mut variant);
    let target = target?;

    let pid = get_u32_property(&target, windows::core::w!("ProcessId"))?;

    match class.as_str() {
        "__InstanceCreationEvent" => Some(WatchEvent::Started(pid)),
        "__InstanceDeletionEvent" => Some(WatchEvent::Stopped(pid)),
        // Modification events are noise for lifecycle tracking
        _ => None,
    }
}

unsafe fn get_string_property(object: &IWbemClassObject, name: PCWSTR) -> Option<String> {
    let mut variant = VARIANT::default();
    object.Get(name, 0, &mut variant, None, None).ok()?;

    let value = {
        let inner = &variant.Anonymous.Anonymous;
        if inner.vt == VT_BSTR {
            Some(inner.Anonymous.bstrVal.to_string())
        } else {
            None
        }
    };

    let _ = VariantClear(&mut variant);
    value
}

unsafe fn get_u32_property(object: &IWbemClassObject, name: PCWSTR) -> Option<u32> {
    let mut variant = VARIANT::default();
    object.Get(name, 0, &mut variant, None, None).ok()?;

    let value = {
        let inner = &variant.Anonymous.Anonymous;
        match inner.vt {
            // WMI surfaces uint32 properties as VT_I4
            VT_I4 => Some(inner.Anonymous.lVal as u32),
            VT_UI4 => Some(inner.Anonymous.ulVal),
            _ => None,
        }
    };

    let _ = VariantClear(&mut variant);
    value
}

unsafe fn variant_to_object(variant: &VARIANT) -> Option<IWbemClassObject> {
    let inner = &variant.Anonymous.Anonymous;
    if inner.vt != VT_UNKNOWN {
        return None;
    }

    inner
        .Anonymous
        .punkVal
        .as_ref()
        .and_then(|unknown| unknown.cast::<IWbemClassObject>().ok())
}

/// Balances `CoInitializeEx` on every exit path of the watch thread.
struct ComGuard;

impl Drop for ComGuard {
    fn drop(&mut self) {
        unsafe { CoUninitialize() };
    }
}
