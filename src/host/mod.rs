//! Host runtime seam. The bridge only ever talks to the managed host through
//! [`HostRuntime`]; production builds back it with the C function table the
//! host glue hands to `BridgeInit`.

use crate::attach::{AttachError, AttachState};
use crate::ffi::{
    AttachThreadFn, BridgeHostVTable, DetachThreadFn, HostFreeStringFn, HostProtectFn,
    HostResolveProcessFn, HostResultFn, PinObjectFn, UnpinObjectFn, BRIDGE_ATTACH_EXISTING,
    BRIDGE_ATTACH_NEW,
};
use std::ffi::{c_char, c_void, CStr};
use std::ptr::NonNull;
use thiserror::Error;

/// Reference to an object living in the host runtime.
///
/// Whether the reference is pinned (valid across threads) depends on where it
/// came from: entry points receive call-local references, the registry stores
/// pinned ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostObject(NonNull<c_void>);

unsafe impl Send for HostObject {}
unsafe impl Sync for HostObject {}

impl HostObject {
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

pub trait HostRuntime: Send + Sync {
    fn attach_current_thread(&self) -> Result<AttachState, AttachError>;

    fn detach_current_thread(&self);

    /// Turns a call-local reference into one that stays valid across threads.
    /// `None` means the host ran out of reference slots.
    fn pin(&self, object: HostObject) -> Option<HostObject>;

    fn unpin(&self, object: HostObject);

    fn protect(&self, target: HostObject, fd: i32);

    /// `None` covers both a null answer and an answer that is not valid UTF-8.
    fn resolve_process(
        &self,
        target: HostObject,
        protocol: i32,
        source: &CStr,
        destination: &CStr,
        uid: i32,
    ) -> Option<String>;

    fn on_result(&self, target: HostObject, data: &CStr);
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("host vtable pointer is null")]
    NullVTable,
    #[error("host method `{0}` is not provided")]
    MissingMethod(&'static str),
    #[error("bridge is already initialized")]
    AlreadyInitialized,
}

impl InitError {
    pub fn status(&self) -> i32 {
        match self {
            Self::NullVTable => -1,
            Self::MissingMethod(_) => -2,
            Self::AlreadyInitialized => -3,
        }
    }
}

/// Method descriptors resolved once from the host vtable.
#[derive(Clone, Copy)]
pub struct MethodTable {
    attach: AttachThreadFn,
    detach: DetachThreadFn,
    pin: PinObjectFn,
    unpin: UnpinObjectFn,
    protect: HostProtectFn,
    resolve_process: HostResolveProcessFn,
    on_result: HostResultFn,
    free_string: HostFreeStringFn,
    context: *mut c_void,
}

unsafe impl Send for MethodTable {}
unsafe impl Sync for MethodTable {}

fn required<T>(entry: Option<T>, name: &'static str) -> Result<T, InitError> {
    entry.ok_or(InitError::MissingMethod(name))
}

impl MethodTable {
    pub fn resolve(vtable: &BridgeHostVTable) -> Result<Self, InitError> {
        Ok(Self {
            attach: required(vtable.attach_current_thread, "attach_current_thread")?,
            detach: required(vtable.detach_current_thread, "detach_current_thread")?,
            pin: required(vtable.pin_object, "pin_object")?,
            unpin: required(vtable.unpin_object, "unpin_object")?,
            protect: required(vtable.protect, "protect")?,
            resolve_process: required(vtable.resolve_process, "resolve_process")?,
            on_result: required(vtable.on_result, "on_result")?,
            free_string: required(vtable.free_string, "free_string")?,
            context: vtable.context,
        })
    }
}

/// [`HostRuntime`] over the C function table.
pub struct VTableHost {
    methods: MethodTable,
}

impl VTableHost {
    pub fn new(methods: MethodTable) -> Self {
        Self { methods }
    }
}

/// Host-allocated string, returned to the host allocator on drop.
struct HostString<'a> {
    ptr: NonNull<c_char>,
    methods: &'a MethodTable,
}

impl HostString<'_> {
    fn to_owned_utf8(&self) -> Option<String> {
        let text = unsafe { CStr::from_ptr(self.ptr.as_ptr()) };
        text.to_str().ok().map(str::to_owned)
    }
}

impl Drop for HostString<'_> {
    fn drop(&mut self) {
        unsafe { (self.methods.free_string)(self.ptr.as_ptr(), self.methods.context) };
    }
}

impl HostRuntime for VTableHost {
    fn attach_current_thread(&self) -> Result<AttachState, AttachError> {
        match unsafe { (self.methods.attach)(self.methods.context) } {
            BRIDGE_ATTACH_EXISTING => Ok(AttachState::Attached),
            BRIDGE_ATTACH_NEW => Ok(AttachState::NewlyAttached),
            status => Err(AttachError::Refused(status)),
        }
    }

    fn detach_current_thread(&self) {
        unsafe { (self.methods.detach)(self.methods.context) };
    }

    fn pin(&self, object: HostObject) -> Option<HostObject> {
        let pinned = unsafe { (self.methods.pin)(object.as_ptr(), self.methods.context) };
        HostObject::from_raw(pinned)
    }

    fn unpin(&self, object: HostObject) {
        unsafe { (self.methods.unpin)(object.as_ptr(), self.methods.context) };
    }

    fn protect(&self, target: HostObject, fd: i32) {
        unsafe { (self.methods.protect)(target.as_ptr(), fd, self.methods.context) };
    }

    fn resolve_process(
        &self,
        target: HostObject,
        protocol: i32,
        source: &CStr,
        destination: &CStr,
        uid: i32,
    ) -> Option<String> {
        let raw = unsafe {
            (self.methods.resolve_process)(
                target.as_ptr(),
                protocol,
                source.as_ptr(),
                destination.as_ptr(),
                uid,
                self.methods.context,
            )
        };
        let owned = HostString {
            ptr: NonNull::new(raw)?,
            methods: &self.methods,
        };
        owned.to_owned_utf8()
    }

    fn on_result(&self, target: HostObject, data: &CStr) {
        unsafe { (self.methods.on_result)(target.as_ptr(), data.as_ptr(), self.methods.context) };
    }
}
