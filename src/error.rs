//! Status codes, their descriptions and the crate error taxonomy.
//!
//! Native calls report an integer status in the OpenCL status space. The
//! [`describe`] table maps each known code to its symbolic name (without the
//! `CL_` prefix, as the host exception names it) and a human-readable
//! description. [`ClError`] is the host-facing form: name, description, code.

use crate::resource::{HandleId, NativeHandle, ResourceKind};

/// Raw native status code. Zero is success.
pub type Status = i32;

/// Symbolic name and description for a native status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorDescriptor {
    pub code: Status,
    pub name: &'static str,
    pub description: &'static str,
}

macro_rules! status_table {
    ($(($konst:ident, $code:literal, $desc:literal)),* $(,)?) => {
        /// Known status codes.
        pub mod status {
            use super::Status;
            $(pub const $konst: Status = $code;)*
        }

        /// Look up the descriptor for a status code.
        pub fn describe(code: Status) -> Option<ErrorDescriptor> {
            match code {
                $($code => Some(ErrorDescriptor {
                    code,
                    name: stringify!($konst),
                    description: $desc,
                }),)*
                _ => None,
            }
        }
    };
}

status_table! {
    (SUCCESS, 0, "Success"),
    (DEVICE_NOT_FOUND, -1, "Device not found"),
    (DEVICE_NOT_AVAILABLE, -2, "Device not available"),
    (COMPILER_NOT_AVAILABLE, -3, "Compiler not available"),
    (MEM_OBJECT_ALLOCATION_FAILURE, -4, "Memory object allocation failure"),
    (OUT_OF_RESOURCES, -5, "Out of resources"),
    (OUT_OF_HOST_MEMORY, -6, "Out of host memory"),
    (PROFILING_INFO_NOT_AVAILABLE, -7, "Profiling information not available"),
    (MEM_COPY_OVERLAP, -8, "Memory copy overlap"),
    (IMAGE_FORMAT_MISMATCH, -9, "Image format mismatch"),
    (IMAGE_FORMAT_NOT_SUPPORTED, -10, "Image format not supported"),
    (BUILD_PROGRAM_FAILURE, -11, "Program build failure"),
    (MAP_FAILURE, -12, "Map failure"),
    (MISALIGNED_SUB_BUFFER_OFFSET, -13, "Misaligned sub-buffer offset"),
    (EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST, -14, "Execution status error for events in wait list"),
    (COMPILE_PROGRAM_FAILURE, -15, "Program compilation failure"),
    (LINKER_NOT_AVAILABLE, -16, "Linker not available"),
    (LINK_PROGRAM_FAILURE, -17, "Program link failure"),
    (DEVICE_PARTITION_FAILED, -18, "Device partition failed"),
    (KERNEL_ARG_INFO_NOT_AVAILABLE, -19, "Kernel argument information not available"),
    (INVALID_VALUE, -30, "Invalid value"),
    (INVALID_DEVICE_TYPE, -31, "Invalid device type"),
    (INVALID_PLATFORM, -32, "Invalid platform"),
    (INVALID_DEVICE, -33, "Invalid device"),
    (INVALID_CONTEXT, -34, "Invalid context"),
    (INVALID_QUEUE_PROPERTIES, -35, "Invalid queue properties"),
    (INVALID_COMMAND_QUEUE, -36, "Invalid command queue"),
    (INVALID_HOST_PTR, -37, "Invalid host pointer"),
    (INVALID_MEM_OBJECT, -38, "Invalid memory object"),
    (INVALID_IMAGE_FORMAT_DESCRIPTOR, -39, "Invalid image format descriptor"),
    (INVALID_IMAGE_SIZE, -40, "Invalid image size"),
    (INVALID_SAMPLER, -41, "Invalid sampler"),
    (INVALID_BINARY, -42, "Invalid binary"),
    (INVALID_BUILD_OPTIONS, -43, "Invalid build options"),
    (INVALID_PROGRAM, -44, "Invalid program"),
    (INVALID_PROGRAM_EXECUTABLE, -45, "Invalid program executable"),
    (INVALID_KERNEL_NAME, -46, "Invalid kernel name"),
    (INVALID_KERNEL_DEFINITION, -47, "Invalid kernel definition"),
    (INVALID_KERNEL, -48, "Invalid kernel"),
    (INVALID_ARG_INDEX, -49, "Invalid argument index"),
    (INVALID_ARG_VALUE, -50, "Invalid argument value"),
    (INVALID_ARG_SIZE, -51, "Invalid argument size"),
    (INVALID_KERNEL_ARGS, -52, "Invalid kernel arguments"),
    (INVALID_WORK_DIMENSION, -53, "Invalid work dimension"),
    (INVALID_WORK_GROUP_SIZE, -54, "Invalid work group size"),
    (INVALID_WORK_ITEM_SIZE, -55, "Invalid work item size"),
    (INVALID_GLOBAL_OFFSET, -56, "Invalid global offset"),
    (INVALID_EVENT_WAIT_LIST, -57, "Invalid event wait list"),
    (INVALID_EVENT, -58, "Invalid event"),
    (INVALID_OPERATION, -59, "Invalid operation"),
    (INVALID_GL_OBJECT, -60, "Invalid OpenGL object"),
    (INVALID_BUFFER_SIZE, -61, "Invalid buffer size"),
    (INVALID_MIP_LEVEL, -62, "Invalid mip-map level"),
    (INVALID_GLOBAL_WORK_SIZE, -63, "Invalid global work size"),
    (INVALID_PROPERTY, -64, "Invalid property"),
    (INVALID_IMAGE_DESCRIPTOR, -65, "Invalid image descriptor"),
    (INVALID_COMPILER_OPTIONS, -66, "Invalid compiler options"),
    (INVALID_LINKER_OPTIONS, -67, "Invalid linker options"),
    (INVALID_DEVICE_PARTITION_COUNT, -68, "Invalid device partition count"),
    (INVALID_GL_SHAREGROUP_REFERENCE_KHR, -1000, "Invalid OpenGL sharegroup reference"),
    (PLATFORM_NOT_FOUND_KHR, -1001, "No valid ICD platform found"),
    (WEBCL_EXTENSION_NOT_ENABLED, 0x8000, "Extension not enabled"),
    (RESOURCE_RELEASED, 0x8001, "Owning resource was released before the operation completed"),
}

/// Symbolic name for a status code, `"UNKNOWN_ERROR"` when unmapped.
pub fn error_name(code: Status) -> &'static str {
    describe(code).map_or("UNKNOWN_ERROR", |d| d.name)
}

/// Description for a status code, `"Unknown error"` when unmapped.
pub fn error_desc(code: Status) -> &'static str {
    describe(code).map_or("Unknown error", |d| d.description)
}

/// A nonzero native status in the form the host raises as an exception.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name} ({code}): {description}")]
pub struct ClError {
    pub name: &'static str,
    pub description: &'static str,
    pub code: Status,
}

impl ClError {
    /// Translate a status. Returns `None` for success.
    pub fn from_status(code: Status) -> Option<Self> {
        if code == status::SUCCESS {
            return None;
        }

        Some(Self {
            name: error_name(code),
            description: error_desc(code),
            code,
        })
    }
}

/// Crate error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A synchronous native call returned a nonzero status.
    #[error("native call failed: {0}")]
    NativeStatus(ClError),

    /// An asynchronous operation completed with a nonzero status.
    ///
    /// Only ever delivered to a completion callback.
    #[error("asynchronous operation failed: {0}")]
    AsyncCompletion(ClError),

    /// A wrapper already exists for this native identity.
    #[error("{kind} {native} is already wrapped")]
    DuplicateResource {
        kind: ResourceKind,
        native: NativeHandle,
    },

    /// A lifecycle operation touched a handle that was already destroyed.
    #[error("{kind} #{id} used after destroy")]
    UseAfterDestroy { kind: ResourceKind, id: HandleId },

    /// A completion bridge was resolved more than once.
    #[error("completion bridge #{bridge} resolved more than once")]
    DoubleResolve { bridge: u64 },
}

impl Error {
    /// The underlying native error, for the status-carrying variants.
    pub fn cl_error(&self) -> Option<&ClError> {
        match self {
            Error::NativeStatus(err) | Error::AsyncCompletion(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Turn the status of a synchronous native call into a `Result`.
pub fn check(code: Status) -> Result<()> {
    match ClError::from_status(code) {
        None => Ok(()),
        Some(err) => Err(Error::NativeStatus(err)),
    }
}
