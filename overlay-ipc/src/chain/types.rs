//! `#[repr(C)]` structure layouts understood by the chain codec.
//!
//! Every chain node begins with a [`StructureType`] tag and a `next` link
//! (see [`BaseInStructure`]). Handles are carried as raw `u64` values.

use std::ffi::c_char;
use std::fmt;
use std::ptr;

/// Discriminates the concrete layout of a chain node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct StructureType(pub u32);

impl StructureType {
    pub const UNKNOWN: Self = Self(0);
    pub const INSTANCE_CREATE_INFO: Self = Self(3);
    pub const SYSTEM_PROPERTIES: Self = Self(5);
    pub const SESSION_CREATE_INFO: Self = Self(8);
    pub const FRAME_END_INFO: Self = Self(12);
    pub const EVENT_DATA_BUFFER: Self = Self(16);
    pub const EVENT_DATA_EVENTS_LOST: Self = Self(17);
    pub const EVENT_DATA_SESSION_STATE_CHANGED: Self = Self(18);
    pub const COMPOSITION_LAYER_QUAD: Self = Self(36);
    pub const BINARY_PAYLOAD: Self = Self(1_000_900_000);

    /// Name of a known type, `None` otherwise.
    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::INSTANCE_CREATE_INFO => "INSTANCE_CREATE_INFO",
            Self::SYSTEM_PROPERTIES => "SYSTEM_PROPERTIES",
            Self::SESSION_CREATE_INFO => "SESSION_CREATE_INFO",
            Self::FRAME_END_INFO => "FRAME_END_INFO",
            Self::EVENT_DATA_BUFFER => "EVENT_DATA_BUFFER",
            Self::EVENT_DATA_EVENTS_LOST => "EVENT_DATA_EVENTS_LOST",
            Self::EVENT_DATA_SESSION_STATE_CHANGED => "EVENT_DATA_SESSION_STATE_CHANGED",
            Self::COMPOSITION_LAYER_QUAD => "COMPOSITION_LAYER_QUAD",
            Self::BINARY_PAYLOAD => "BINARY_PAYLOAD",
            _ => return None,
        })
    }
}

impl fmt::Debug for StructureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "StructureType({})", self.0),
        }
    }
}

/// Common prefix of every chain node.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BaseInStructure {
    pub ty: StructureType,
    pub next: *const BaseInStructure,
}

impl BaseInStructure {
    #[must_use]
    pub const fn new(ty: StructureType) -> Self {
        Self {
            ty,
            next: ptr::null(),
        }
    }
}

/// A concrete chain node type.
///
/// # Safety
///
/// The type must be `#[repr(C)]` and start with the fields of
/// [`BaseInStructure`], with `TYPE` as the tag it is always created with.
pub unsafe trait TypedStructure: Sized {
    const TYPE: StructureType;

    /// This node viewed as a chain head.
    fn as_base(&self) -> *const BaseInStructure {
        ptr::from_ref(self).cast()
    }
}

macro_rules! typed_structure {
    ($($t:ty => $tag:ident),* $(,)?) => {
        $(
            // SAFETY: repr(C) with the base fields first, checked below.
            unsafe impl TypedStructure for $t {
                const TYPE: StructureType = StructureType::$tag;
            }

            const _: () = assert!(std::mem::offset_of!($t, next) == std::mem::offset_of!(BaseInStructure, next));
        )*
    };
}

pub const MAX_APPLICATION_NAME_SIZE: usize = 128;
pub const MAX_ENGINE_NAME_SIZE: usize = 128;
pub const MAX_SYSTEM_NAME_SIZE: usize = 256;
pub const MAX_EVENT_DATA_SIZE: usize = 4000;

/// Inline part of [`InstanceCreateInfo`]; not a chain node.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ApplicationInfo {
    pub application_name: [c_char; MAX_APPLICATION_NAME_SIZE],
    pub application_version: u32,
    pub engine_name: [c_char; MAX_ENGINE_NAME_SIZE],
    pub engine_version: u32,
    pub api_version: u64,
}

impl Default for ApplicationInfo {
    fn default() -> Self {
        Self {
            application_name: [0; MAX_APPLICATION_NAME_SIZE],
            application_version: 0,
            engine_name: [0; MAX_ENGINE_NAME_SIZE],
            engine_version: 0,
            api_version: 0,
        }
    }
}

/// Carries two arrays of C strings out of line.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InstanceCreateInfo {
    pub ty: StructureType,
    pub next: *const BaseInStructure,
    pub create_flags: u64,
    pub application_info: ApplicationInfo,
    pub enabled_api_layer_count: u32,
    pub enabled_api_layer_names: *const *const c_char,
    pub enabled_extension_count: u32,
    pub enabled_extension_names: *const *const c_char,
}

impl Default for InstanceCreateInfo {
    fn default() -> Self {
        Self {
            ty: Self::TYPE,
            next: ptr::null(),
            create_flags: 0,
            application_info: ApplicationInfo::default(),
            enabled_api_layer_count: 0,
            enabled_api_layer_names: ptr::null(),
            enabled_extension_count: 0,
            enabled_extension_names: ptr::null(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SessionCreateInfo {
    pub ty: StructureType,
    pub next: *const BaseInStructure,
    pub create_flags: u64,
    pub system_id: u64,
}

impl Default for SessionCreateInfo {
    fn default() -> Self {
        Self {
            ty: Self::TYPE,
            next: ptr::null(),
            create_flags: 0,
            system_id: 0,
        }
    }
}

/// Opaque byte payload carried out of line.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BinaryPayload {
    pub ty: StructureType,
    pub next: *const BaseInStructure,
    pub size: u32,
    pub data: *const u8,
}

impl Default for BinaryPayload {
    fn default() -> Self {
        Self {
            ty: Self::TYPE,
            next: ptr::null(),
            size: 0,
            data: ptr::null(),
        }
    }
}

/// Points to an array of nested layer chains.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FrameEndInfo {
    pub ty: StructureType,
    pub next: *const BaseInStructure,
    pub display_time: i64,
    pub environment_blend_mode: u32,
    pub layer_count: u32,
    pub layers: *const *const BaseInStructure,
}

impl Default for FrameEndInfo {
    fn default() -> Self {
        Self {
            ty: Self::TYPE,
            next: ptr::null(),
            display_time: 0,
            environment_blend_mode: 0,
            layer_count: 0,
            layers: ptr::null(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Posef {
    pub orientation: [f32; 4],
    pub position: [f32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CompositionLayerQuad {
    pub ty: StructureType,
    pub next: *const BaseInStructure,
    pub layer_flags: u64,
    pub space: u64,
    pub swapchain: u64,
    pub image_array_index: u32,
    pub pose: Posef,
    pub size: [f32; 2],
}

impl Default for CompositionLayerQuad {
    fn default() -> Self {
        Self {
            ty: Self::TYPE,
            next: ptr::null(),
            layer_flags: 0,
            space: 0,
            swapchain: 0,
            image_array_index: 0,
            pose: Posef::default(),
            size: [0.0; 2],
        }
    }
}

/// Output structure filled by the callee.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SystemProperties {
    pub ty: StructureType,
    pub next: *const BaseInStructure,
    pub system_id: u64,
    pub vendor_id: u32,
    pub system_name: [c_char; MAX_SYSTEM_NAME_SIZE],
    pub max_layer_count: u32,
    pub max_swapchain_image_width: u32,
    pub max_swapchain_image_height: u32,
}

impl Default for SystemProperties {
    fn default() -> Self {
        Self {
            ty: Self::TYPE,
            next: ptr::null(),
            system_id: 0,
            vendor_id: 0,
            system_name: [0; MAX_SYSTEM_NAME_SIZE],
            max_layer_count: 0,
            max_swapchain_image_width: 0,
            max_swapchain_image_height: 0,
        }
    }
}

/// Fixed-size storage large enough for any event.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EventDataBuffer {
    pub ty: StructureType,
    pub next: *const BaseInStructure,
    pub varying: [u8; MAX_EVENT_DATA_SIZE],
}

impl Default for EventDataBuffer {
    fn default() -> Self {
        Self {
            ty: Self::TYPE,
            next: ptr::null(),
            varying: [0; MAX_EVENT_DATA_SIZE],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EventDataEventsLost {
    pub ty: StructureType,
    pub next: *const BaseInStructure,
    pub lost_event_count: u32,
}

impl Default for EventDataEventsLost {
    fn default() -> Self {
        Self {
            ty: Self::TYPE,
            next: ptr::null(),
            lost_event_count: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EventDataSessionStateChanged {
    pub ty: StructureType,
    pub next: *const BaseInStructure,
    pub session: u64,
    pub state: u32,
    pub time: i64,
}

impl Default for EventDataSessionStateChanged {
    fn default() -> Self {
        Self {
            ty: Self::TYPE,
            next: ptr::null(),
            session: 0,
            state: 0,
            time: 0,
        }
    }
}

typed_structure! {
    InstanceCreateInfo => INSTANCE_CREATE_INFO,
    SessionCreateInfo => SESSION_CREATE_INFO,
    BinaryPayload => BINARY_PAYLOAD,
    FrameEndInfo => FRAME_END_INFO,
    CompositionLayerQuad => COMPOSITION_LAYER_QUAD,
    SystemProperties => SYSTEM_PROPERTIES,
    EventDataBuffer => EVENT_DATA_BUFFER,
    EventDataEventsLost => EVENT_DATA_EVENTS_LOST,
    EventDataSessionStateChanged => EVENT_DATA_SESSION_STATE_CHANGED,
}

/// Byte size of a known event structure.
#[must_use]
pub const fn event_size(ty: StructureType) -> Option<usize> {
    Some(match ty {
        StructureType::EVENT_DATA_BUFFER => size_of::<EventDataBuffer>(),
        StructureType::EVENT_DATA_EVENTS_LOST => size_of::<EventDataEventsLost>(),
        StructureType::EVENT_DATA_SESSION_STATE_CHANGED => {
            size_of::<EventDataSessionStateChanged>()
        }
        _ => return None,
    })
}
