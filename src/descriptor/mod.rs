// Descriptor management
//
// Layouts are deduplicated by content, sets come from growable pool lists,
// and the factory ties both together behind a chained builder.

pub mod allocator;
pub mod factory;
pub mod layout_cache;

pub use allocator::DescriptorAllocator;
pub use factory::DescriptorFactory;
pub use layout_cache::DescriptorLayoutCache;
